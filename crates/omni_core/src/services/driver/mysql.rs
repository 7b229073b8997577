//! MySQL driver on sqlx.

use super::{Driver, DriverConnection};
use crate::error::{OmniError, OmniResult};
use crate::models::{ConnectionTarget, DriverKind, Row, SqlValue};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::query::Query;
use sqlx::{Column, Connection, Decode, Row as _, Type, TypeInfo};
use std::time::Duration;

/// Opens sqlx MySQL connections.
#[derive(Debug, Default)]
pub struct MySqlDriver;

impl MySqlDriver {
    /// Create the driver.
    pub fn new() -> Self {
        Self
    }

    fn options(target: &ConnectionTarget) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.username)
            .password(&target.password)
            .ssl_mode(MySqlSslMode::Disabled)
            .charset("utf8mb4");
        match target.database_name() {
            Some(database) => options.database(database),
            None => options,
        }
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::MySql
    }

    async fn connect(
        &self,
        target: &ConnectionTarget,
        timeout: Duration,
    ) -> OmniResult<Box<dyn DriverConnection>> {
        let options = Self::options(target);
        let conn = tokio::time::timeout(timeout, MySqlConnection::connect_with(&options))
            .await
            .map_err(|_| {
                OmniError::connect(format!(
                    "Timed out after {timeout:?} connecting to {}:{}",
                    target.host, target.port
                ))
            })?
            .map_err(OmniError::from)?;

        Ok(Box::new(MySqlDriverConnection { conn }))
    }
}

struct MySqlDriverConnection {
    conn: MySqlConnection,
}

#[async_trait]
impl DriverConnection for MySqlDriverConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<Vec<Row>> {
        let query = params.iter().fold(sqlx::query(sql), bind_value);
        let rows = query.fetch_all(&mut self.conn).await?;
        Ok(rows.iter().map(row_values).collect())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<u64> {
        let query = params.iter().fold(sqlx::query(sql), bind_value);
        Ok(query.execute(&mut self.conn).await?.rows_affected())
    }

    async fn ping(&mut self) -> OmniResult<()> {
        self.conn.ping().await?;
        Ok(())
    }
}

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

fn bind_value<'q>(query: MySqlQuery<'q>, value: &SqlValue) -> MySqlQuery<'q> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Bytes(v) => query.bind(v.clone()),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
        SqlValue::Json(v) => query.bind(v.to_string()),
    }
}

fn cell<'r, T>(row: &'r MySqlRow, i: usize, wrap: impl Fn(T) -> SqlValue) -> SqlValue
where
    T: Decode<'r, MySql> + Type<MySql>,
{
    match row.try_get::<Option<T>, _>(i) {
        Ok(v) => v.map(wrap).unwrap_or(SqlValue::Null),
        Err(e) => {
            tracing::trace!(column = i, error = %e, "Failed to decode MySQL value");
            SqlValue::Null
        }
    }
}

/// Text-encoded values (DECIMAL, JSON, ENUM, SET) decoded without the type check.
fn text_cell(row: &MySqlRow, i: usize) -> Option<String> {
    row.try_get_unchecked::<Option<String>, _>(i).ok().flatten()
}

/// Convert a MySQL row, switching on each column's reported type name.
fn row_values(row: &MySqlRow) -> Row {
    let mut out = Row::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let type_name = col.type_info().name().to_ascii_uppercase();
        let value = match type_name.as_str() {
            "NULL" => SqlValue::Null,
            "BOOLEAN" => cell(row, i, SqlValue::Bool),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => cell(row, i, SqlValue::Int),
            "YEAR" => cell(row, i, |v: u16| SqlValue::Int(v.into())),
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" => cell(row, i, |v: u64| match i64::try_from(v) {
                Ok(n) => SqlValue::Int(n),
                Err(_) => SqlValue::Text(v.to_string()),
            }),
            "FLOAT" => cell(row, i, |v: f32| SqlValue::Float(v.into())),
            "DOUBLE" => cell(row, i, SqlValue::Float),
            "DATE" => cell(row, i, |v: NaiveDate| SqlValue::Date(v)),
            "TIME" => cell(row, i, |v: NaiveTime| SqlValue::Time(v)),
            "DATETIME" => cell(row, i, |v: NaiveDateTime| SqlValue::DateTime(v)),
            "TIMESTAMP" => cell(row, i, |v: DateTime<Utc>| SqlValue::Timestamp(v)),
            "JSON" => match text_cell(row, i) {
                Some(text) => serde_json::from_str(&text)
                    .map(SqlValue::Json)
                    .unwrap_or(SqlValue::Text(text)),
                None => SqlValue::Null,
            },
            "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
                cell(row, i, SqlValue::Bytes)
            }
            _ => text_cell(row, i).map(SqlValue::Text).unwrap_or(SqlValue::Null),
        };
        out.insert(col.name(), value);
    }
    out
}
