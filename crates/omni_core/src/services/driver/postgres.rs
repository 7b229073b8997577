//! PostgreSQL driver on tokio-postgres.

use super::{numbered_placeholders, Driver, DriverConnection};
use crate::error::{OmniError, OmniResult};
use crate::models::{ConnectionTarget, DriverKind, Row, SqlValue};

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::error::Error;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::NoTls;
use uuid::Uuid;

type BoxError = Box<dyn Error + Sync + Send>;

/// Opens tokio-postgres connections.
#[derive(Debug, Default)]
pub struct PostgresDriver {
    application_name: String,
}

impl PostgresDriver {
    /// Create the driver.
    pub fn new() -> Self {
        Self { application_name: "omni".to_string() }
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn connect(
        &self,
        target: &ConnectionTarget,
        timeout: Duration,
    ) -> OmniResult<Box<dyn DriverConnection>> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&target.host)
            .port(target.port)
            .user(&target.username)
            .password(&target.password)
            .application_name(&self.application_name)
            .connect_timeout(timeout)
            .keepalives(true)
            .keepalives_idle(Duration::from_secs(60));
        if let Some(database) = target.database_name() {
            pg_config.dbname(database);
        }

        let (client, connection) = tokio::time::timeout(timeout, pg_config.connect(NoTls))
            .await
            .map_err(|_| {
                OmniError::connect(format!(
                    "Timed out after {timeout:?} connecting to {}:{}",
                    target.host, target.port
                ))
            })?
            .map_err(OmniError::from)?;

        let host = target.host.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(host = %host, error = %e, "PostgreSQL connection ended with error");
            }
        });

        Ok(Box::new(PostgresConnection { client }))
    }
}

struct PostgresConnection {
    client: tokio_postgres::Client,
}

impl PostgresConnection {
    fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
    }
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<Vec<Row>> {
        let sql = numbered_placeholders(sql);
        let rows = self.client.query(sql.as_str(), &Self::bind(params)).await?;
        Ok(rows.iter().map(row_values).collect())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<u64> {
        let sql = numbered_placeholders(sql);
        Ok(self.client.execute(sql.as_str(), &Self::bind(params)).await?)
    }

    async fn ping(&mut self) -> OmniResult<()> {
        if self.client.is_closed() {
            return Err(OmniError::connect("Connection closed"));
        }
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

/// Binds a [`SqlValue`] against whatever type the server inferred for the
/// parameter, so an `Int` works for `int2`, `int4` and `int8` columns alike.
impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql_checked(ty, out),
            SqlValue::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::OID => u32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*v).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    v.to_string().to_sql(ty, out)
                }
                _ => v.to_sql_checked(ty, out),
            },
            SqlValue::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            SqlValue::Text(v) => match *ty {
                Type::JSON | Type::JSONB => JsonValue::String(v.clone()).to_sql(ty, out),
                Type::NUMERIC => Decimal::from_str(v.trim())?.to_sql(ty, out),
                Type::UUID => Uuid::parse_str(v.trim())?.to_sql(ty, out),
                _ => v.as_str().to_sql_checked(ty, out),
            },
            SqlValue::Bytes(v) => v.as_slice().to_sql_checked(ty, out),
            SqlValue::Date(v) => v.to_sql_checked(ty, out),
            SqlValue::Time(v) => v.to_sql_checked(ty, out),
            SqlValue::DateTime(v) => match *ty {
                Type::TIMESTAMPTZ => v.and_utc().to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            SqlValue::Timestamp(v) => match *ty {
                Type::TIMESTAMP => v.naive_utc().to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            SqlValue::Json(v) => match *ty {
                Type::JSON | Type::JSONB => v.to_sql(ty, out),
                _ => v.to_string().to_sql_checked(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Raw wire bytes for types without a dedicated decoder.
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// NUMERIC as exact decimal text. Values outside the decimal range keep
/// their wire bytes.
fn numeric_value(raw: &[u8]) -> SqlValue {
    match Decimal::from_sql(&Type::NUMERIC, raw) {
        Ok(v) => SqlValue::Text(v.to_string()),
        // sign word 0xC000 marks NaN
        Err(_) if raw.get(4..6) == Some(&[0xC0, 0x00]) => SqlValue::Text("NaN".to_string()),
        Err(_) => SqlValue::Bytes(raw.to_vec()),
    }
}

fn uuid_value(raw: &[u8]) -> SqlValue {
    match Uuid::from_sql(&Type::UUID, raw) {
        Ok(v) => SqlValue::Text(v.to_string()),
        Err(_) => SqlValue::Bytes(raw.to_vec()),
    }
}

fn cell<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, i: usize, wrap: impl Fn(T) -> SqlValue) -> SqlValue {
    row.try_get::<_, Option<T>>(i)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(SqlValue::Null)
}

/// Convert a PostgreSQL row, switching on each column's type.
fn row_values(row: &tokio_postgres::Row) -> Row {
    let mut out = Row::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let value = match *col.type_() {
            Type::BOOL => cell(row, i, SqlValue::Bool),
            Type::INT2 => cell(row, i, |v: i16| SqlValue::Int(v.into())),
            Type::INT4 => cell(row, i, |v: i32| SqlValue::Int(v.into())),
            Type::INT8 => cell(row, i, SqlValue::Int),
            Type::OID => cell(row, i, |v: u32| SqlValue::Int(v.into())),
            Type::FLOAT4 => cell(row, i, |v: f32| SqlValue::Float(v.into())),
            Type::FLOAT8 => cell(row, i, SqlValue::Float),
            Type::BYTEA => cell(row, i, SqlValue::Bytes),
            Type::NUMERIC => cell(row, i, |v: RawValue| numeric_value(&v.0)),
            Type::UUID => cell(row, i, |v: RawValue| uuid_value(&v.0)),
            Type::JSON | Type::JSONB => cell(row, i, SqlValue::Json),
            Type::DATE => cell(row, i, |v: NaiveDate| SqlValue::Date(v)),
            Type::TIME => cell(row, i, |v: NaiveTime| SqlValue::Time(v)),
            Type::TIMESTAMP => cell(row, i, |v: NaiveDateTime| SqlValue::DateTime(v)),
            Type::TIMESTAMPTZ => cell(row, i, |v: DateTime<Utc>| SqlValue::Timestamp(v)),
            _ => match row.try_get::<_, Option<String>>(i) {
                Ok(v) => v.map(SqlValue::Text).unwrap_or(SqlValue::Null),
                Err(_) => cell(row, i, |v: RawValue| SqlValue::Bytes(v.0)),
            },
        };
        out.insert(col.name(), value);
    }
    out
}
