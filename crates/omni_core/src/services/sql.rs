//! Identifier validation and existence-check statements.
//!
//! Table and column names cannot be bound as parameters, so every path that
//! puts a caller-supplied identifier into SQL text goes through
//! [`validate_identifier`]. Values are always bound, never interpolated.

use crate::error::{OmniError, OmniResult};

/// Tokens rejected anywhere in a raw condition fragment (case-insensitive).
const FORBIDDEN_CONDITION_TOKENS: [&str; 5] = ["DELETE ", "UPDATE ", "INSERT ", "DROP ", "--"];

/// Check that `identifier` matches `^[A-Za-z0-9_]+$`.
pub fn validate_identifier(identifier: &str) -> OmniResult<&str> {
    let valid = !identifier.is_empty()
        && identifier.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(identifier)
    } else {
        Err(OmniError::invalid_identifier(identifier))
    }
}

/// Check a raw condition fragment such as `"total > ?"`.
///
/// Rejects forbidden statement tokens and statement separators, then
/// validates the leading column name when one can be extracted.
pub fn validate_condition(condition: &str) -> OmniResult<&str> {
    let upper = condition.to_ascii_uppercase();
    if condition.trim().is_empty()
        || condition.contains(';')
        || FORBIDDEN_CONDITION_TOKENS.iter().any(|token| upper.contains(token))
    {
        return Err(OmniError::invalid_condition(condition));
    }

    if let Some(column) = leading_column(condition) {
        validate_identifier(column)?;
    }
    Ok(condition)
}

/// The column name left of the first comparison operator, if the fragment
/// has that shape.
fn leading_column(condition: &str) -> Option<&str> {
    let end = condition.find(|c: char| matches!(c, '=' | '<' | '>' | '!'))?;
    let lhs = condition[..end].trim();
    // `col IS NULL`, `LOWER(col) = ?` and friends are left to the database.
    if lhs.is_empty() || lhs.contains(|c: char| c.is_whitespace() || c == '(') {
        return None;
    }
    Some(lhs)
}

/// `SELECT 1 FROM <table> WHERE <c1> = ? AND <c2> = ? LIMIT 1`.
pub fn record_exists_sql<'a>(
    table: &str,
    columns: impl IntoIterator<Item = &'a str>,
) -> OmniResult<String> {
    let conditions = columns
        .into_iter()
        .map(|column| validate_identifier(column).map(|c| format!("{c} = ?")))
        .collect::<OmniResult<Vec<_>>>()?;
    row_exists_sql(table, &conditions)
}

/// `SELECT 1 FROM <table> WHERE <cond1> AND <cond2> LIMIT 1`.
pub fn row_exists_sql(table: &str, conditions: &[impl AsRef<str>]) -> OmniResult<String> {
    validate_identifier(table)?;
    if conditions.is_empty() {
        return Err(OmniError::invalid_argument("At least one condition is required"));
    }
    let clauses = conditions
        .iter()
        .map(|c| validate_condition(c.as_ref()))
        .collect::<OmniResult<Vec<_>>>()?;
    Ok(format!("SELECT 1 FROM {table} WHERE {} LIMIT 1", clauses.join(" AND ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_accepts_word_characters() {
        for ok in ["orders", "order_items", "T1", "_x", "2024_archive"] {
            assert!(validate_identifier(ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn test_validate_identifier_rejects_everything_else() {
        for bad in ["", "orders;", "order items", "o.id", "orders--", "`orders`", "ordérs", "a\n"] {
            let err = validate_identifier(bad).unwrap_err();
            assert!(matches!(err, OmniError::InvalidIdentifier { .. }), "{bad:?}");
        }
    }

    #[test]
    fn test_validate_condition_rejects_injection() {
        for bad in [
            "id = ?; DROP TABLE x; --",
            "id = ? -- trailing",
            "id = ?; delete from orders",
            "status = 'a' OR 1=1; update orders set x=1",
            "insert into t values (1)",
            "   ",
        ] {
            assert!(validate_condition(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_validate_condition_checks_extractable_column() {
        assert!(validate_condition("total > ?").is_ok());
        assert!(validate_condition("status != ?").is_ok());
        assert!(validate_condition("created_at IS NULL").is_ok());
        assert!(validate_condition("LOWER(email) = ?").is_ok());

        let err = validate_condition("o.total > ?").unwrap_err();
        assert!(matches!(err, OmniError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_forbidden_tokens_need_trailing_space() {
        // Column names that merely contain a keyword are fine.
        assert!(validate_condition("updated_at > ?").is_ok());
        assert!(validate_condition("is_deleted = ?").is_ok());
    }

    #[test]
    fn test_record_exists_sql() {
        let sql = record_exists_sql("orders", ["customer_id", "status"]).unwrap();
        assert_eq!(sql, "SELECT 1 FROM orders WHERE customer_id = ? AND status = ? LIMIT 1");
    }

    #[test]
    fn test_record_exists_sql_rejects_bad_names() {
        assert!(record_exists_sql("orders; --", ["id"]).is_err());
        assert!(record_exists_sql("orders", ["id desc"]).is_err());
        assert!(record_exists_sql("orders", std::iter::empty()).is_err());
    }

    #[test]
    fn test_row_exists_sql() {
        let sql = row_exists_sql("orders", &["total > ?", "status = ?"]).unwrap();
        assert_eq!(sql, "SELECT 1 FROM orders WHERE total > ? AND status = ? LIMIT 1");
    }
}
