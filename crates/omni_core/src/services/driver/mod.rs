//! Database drivers.
//!
//! A [`Driver`] turns a resolved [`ConnectionTarget`] into a live
//! [`DriverConnection`]. SQL handed to drivers uses `?` placeholders; each
//! driver adapts them to its wire dialect.

pub mod mysql;
pub mod postgres;

use crate::error::{OmniError, OmniResult};
use crate::models::{ConnectionTarget, DriverKind, Row, SqlValue};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use mysql::MySqlDriver;
pub use postgres::PostgresDriver;

/// A single physical database connection.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Run a statement that returns rows.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<Vec<Row>>;

    /// Run a statement and return the affected row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<u64>;

    /// Cheap liveness check used when recycling pooled connections.
    async fn ping(&mut self) -> OmniResult<()>;
}

/// Opens physical connections for one [`DriverKind`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// Which targets this driver serves.
    fn kind(&self) -> DriverKind;

    /// Open a connection, giving up after `timeout`.
    async fn connect(
        &self,
        target: &ConnectionTarget,
        timeout: Duration,
    ) -> OmniResult<Box<dyn DriverConnection>>;
}

/// The drivers available to the pool manager, keyed by kind.
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: HashMap<DriverKind, Arc<dyn Driver>>,
}

impl DriverSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// MySQL and PostgreSQL.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_driver(Arc::new(MySqlDriver::new()))
            .with_driver(Arc::new(PostgresDriver::new()))
    }

    /// Add or replace the driver for its kind.
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    /// Get the driver for `kind`.
    pub fn get(&self, kind: DriverKind) -> OmniResult<Arc<dyn Driver>> {
        self.drivers.get(&kind).cloned().ok_or_else(|| {
            OmniError::pool_creation(format!("No driver registered for {kind}"))
        })
    }
}

/// Rewrite `?` placeholders to `$1, $2, ...`.
///
/// Question marks inside single-quoted literals, double-quoted identifiers and
/// `--` line comments are left alone.
pub fn numbered_placeholders(sql: &str) -> String {
    let mut n = 0;
    scan_placeholders(sql, |out| {
        n += 1;
        out.push('$');
        out.push_str(&n.to_string());
    })
}

/// Number of `?` placeholders outside literals and comments.
pub fn placeholder_count(sql: &str) -> usize {
    let mut n = 0;
    scan_placeholders(sql, |out| {
        n += 1;
        out.push('?');
    });
    n
}

/// Copy `sql`, handing each bare `?` to `on_placeholder` to write instead.
fn scan_placeholders(sql: &str, mut on_placeholder: impl FnMut(&mut String)) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    // Doubled quote is an escaped quote, stay inside.
                    if chars.peek() == Some(&q) {
                        out.push(q);
                        chars.next();
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    out.push(c);
                    for rest in chars.by_ref() {
                        out.push(rest);
                        if rest == '\n' {
                            break;
                        }
                    }
                }
                '?' => on_placeholder(&mut out),
                _ => out.push(c),
            },
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_placeholders() {
        assert_eq!(
            numbered_placeholders("SELECT 1 FROM orders WHERE a = ? AND b = ? LIMIT 1"),
            "SELECT 1 FROM orders WHERE a = $1 AND b = $2 LIMIT 1"
        );
    }

    #[test]
    fn test_placeholders_inside_literals_untouched() {
        assert_eq!(
            numbered_placeholders("SELECT '?', \"a?\" FROM t WHERE x = ? AND y = 'it''s ?'"),
            "SELECT '?', \"a?\" FROM t WHERE x = $1 AND y = 'it''s ?'"
        );
    }

    #[test]
    fn test_placeholders_inside_comments_untouched() {
        assert_eq!(
            numbered_placeholders("SELECT ? -- why?\nFROM t WHERE x = ?"),
            "SELECT $1 -- why?\nFROM t WHERE x = $2"
        );
    }

    #[test]
    fn test_placeholder_count_skips_literals_and_comments() {
        assert_eq!(placeholder_count("total > ?"), 1);
        assert_eq!(placeholder_count("note = 'why?'"), 0);
        assert_eq!(placeholder_count("\"a?\" = ? AND b = 'it''s ?' -- or ?"), 1);
        assert_eq!(placeholder_count("a = ? OR b = ?"), 2);
    }

    #[test]
    fn test_driver_set_missing_kind() {
        let set = DriverSet::new();
        assert!(matches!(set.get(DriverKind::MySql), Err(OmniError::PoolCreation { .. })));

        let set = DriverSet::with_defaults();
        assert_eq!(set.get(DriverKind::Postgres).unwrap().kind(), DriverKind::Postgres);
    }
}
