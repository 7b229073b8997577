//! The entry point consumers use for database access.
//!
//! [`ConnectionFacade`] resolves a configuration name to a pooled connection
//! and layers query/update helpers and existence checks on top. Every
//! statement is bounded by the query timeout, and failures come back as
//! [`OmniError`] values labelled with what the caller was doing.

use crate::error::{OmniError, OmniResult};
use crate::models::{Row, SqlValue};
use crate::services::driver::placeholder_count;
use crate::services::pool::{PoolManager, PooledConnection};
use crate::services::sql;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Query and update helpers over [`PoolManager`].
#[derive(Clone)]
pub struct ConnectionFacade {
    pools: Arc<PoolManager>,
    query_timeout: Duration,
}

impl ConnectionFacade {
    /// Create a facade using the pool settings' query timeout.
    pub fn new(pools: Arc<PoolManager>) -> Self {
        let query_timeout = pools.settings().query_timeout;
        Self { pools, query_timeout }
    }

    /// Override the per-statement timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// The pool manager behind this facade.
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Check out a connection for `name`. It returns to the pool on drop.
    pub async fn acquire(&self, name: &str) -> OmniResult<PooledConnection> {
        self.pools.acquire_connection(name).await
    }

    /// Run a parameterized read and materialize every row.
    pub async fn query(&self, name: &str, sql: &str, params: &[SqlValue]) -> OmniResult<Vec<Row>> {
        self.run_query(name, sql, params, || format!("query on {name}")).await
    }

    /// Run a parameterized write and return the affected row count.
    pub async fn update(&self, name: &str, sql: &str, params: &[SqlValue]) -> OmniResult<u64> {
        let intent = || format!("update on {name}");
        let mut conn = self.acquire(name).await?;
        let outcome = tokio::time::timeout(self.query_timeout, conn.execute(sql, params)).await;
        match outcome {
            Ok(result) => result.map_err(|e| e.into_update_failed(intent())),
            Err(_) => {
                conn.discard();
                Err(OmniError::UpdateFailed {
                    intent: intent(),
                    message: format!("Timed out after {:?}", self.query_timeout),
                    code: None,
                    source: None,
                })
            }
        }
    }

    /// Whether a row in `table` matches every `column = value` pair.
    ///
    /// Table and column names are validated before anything touches the
    /// pool; values are bound as parameters.
    pub async fn record_exists(
        &self,
        name: &str,
        table: &str,
        conditions: &[(&str, SqlValue)],
    ) -> OmniResult<bool> {
        let sql = sql::record_exists_sql(table, conditions.iter().map(|(column, _)| *column))?;
        let params: Vec<SqlValue> = conditions.iter().map(|(_, value)| value.clone()).collect();
        self.exists(name, table, &sql, &params).await
    }

    /// Whether a row in `table` satisfies every raw condition fragment.
    ///
    /// Fragments such as `"total > ?"` are screened for injected statements
    /// and their column names validated where extractable. The number of `?`
    /// placeholders across all fragments, not counting any inside quotes or
    /// comments, must match `params`.
    pub async fn row_exists(
        &self,
        name: &str,
        table: &str,
        conditions: &[&str],
        params: &[SqlValue],
    ) -> OmniResult<bool> {
        let sql = sql::row_exists_sql(table, conditions)?;
        let placeholders: usize = conditions.iter().map(|c| placeholder_count(c)).sum();
        if placeholders != params.len() {
            return Err(OmniError::invalid_argument(format!(
                "Conditions use {placeholders} parameters but {} were given",
                params.len()
            )));
        }
        self.exists(name, table, &sql, params).await
    }

    /// Whether any row in `table` has `column = value`.
    pub async fn value_exists(
        &self,
        name: &str,
        table: &str,
        column: &str,
        value: impl Into<SqlValue>,
    ) -> OmniResult<bool> {
        self.record_exists(name, table, &[(column, value.into())]).await
    }

    /// First column of the first row, or `None` for an empty result.
    pub async fn single_value(
        &self,
        name: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> OmniResult<Option<SqlValue>> {
        let rows = self.run_query(name, sql, params, || format!("single value on {name}")).await?;
        Ok(rows.into_iter().next().and_then(|row| row.first().cloned()))
    }

    /// A handle scoped to one configuration name.
    pub fn handle(&self, name: impl Into<String>) -> DatabaseHandle {
        DatabaseHandle { facade: self.clone(), name: name.into(), closed: AtomicBool::new(false) }
    }

    async fn exists(
        &self,
        name: &str,
        table: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> OmniResult<bool> {
        let rows = self
            .run_query(name, sql, params, || format!("record exists check on {table}"))
            .await?;
        Ok(!rows.is_empty())
    }

    async fn run_query(
        &self,
        name: &str,
        sql: &str,
        params: &[SqlValue],
        intent: impl Fn() -> String,
    ) -> OmniResult<Vec<Row>> {
        let mut conn = self.acquire(name).await?;
        let outcome = tokio::time::timeout(self.query_timeout, conn.query(sql, params)).await;
        match outcome {
            Ok(result) => result.map_err(|e| e.into_query_failed(intent())),
            Err(_) => {
                // The statement may still be running server-side.
                conn.discard();
                Err(OmniError::QueryFailed {
                    intent: intent(),
                    message: format!("Timed out after {:?}", self.query_timeout),
                    code: None,
                    source: None,
                })
            }
        }
    }
}

/// A [`ConnectionFacade`] bound to one configuration name.
///
/// Closing the handle only disables it; the shared pool stays up for other
/// callers.
pub struct DatabaseHandle {
    facade: ConnectionFacade,
    name: String,
    closed: AtomicBool,
}

impl DatabaseHandle {
    /// Configuration name this handle serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Disable the handle. Further calls fail with `InvalidArgument`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(config_name = %self.name, "Database handle closed");
        }
    }

    /// Whether [`DatabaseHandle::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// See [`ConnectionFacade::acquire`].
    pub async fn acquire(&self) -> OmniResult<PooledConnection> {
        self.ensure_open()?;
        self.facade.acquire(&self.name).await
    }

    /// See [`ConnectionFacade::query`].
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> OmniResult<Vec<Row>> {
        self.ensure_open()?;
        self.facade.query(&self.name, sql, params).await
    }

    /// See [`ConnectionFacade::update`].
    pub async fn update(&self, sql: &str, params: &[SqlValue]) -> OmniResult<u64> {
        self.ensure_open()?;
        self.facade.update(&self.name, sql, params).await
    }

    /// See [`ConnectionFacade::record_exists`].
    pub async fn record_exists(&self, table: &str, conditions: &[(&str, SqlValue)]) -> OmniResult<bool> {
        self.ensure_open()?;
        self.facade.record_exists(&self.name, table, conditions).await
    }

    /// See [`ConnectionFacade::row_exists`].
    pub async fn row_exists(
        &self,
        table: &str,
        conditions: &[&str],
        params: &[SqlValue],
    ) -> OmniResult<bool> {
        self.ensure_open()?;
        self.facade.row_exists(&self.name, table, conditions, params).await
    }

    /// See [`ConnectionFacade::value_exists`].
    pub async fn value_exists(
        &self,
        table: &str,
        column: &str,
        value: impl Into<SqlValue>,
    ) -> OmniResult<bool> {
        self.ensure_open()?;
        self.facade.value_exists(&self.name, table, column, value).await
    }

    /// See [`ConnectionFacade::single_value`].
    pub async fn single_value(&self, sql: &str, params: &[SqlValue]) -> OmniResult<Option<SqlValue>> {
        self.ensure_open()?;
        self.facade.single_value(&self.name, sql, params).await
    }

    fn ensure_open(&self) -> OmniResult<()> {
        if self.is_closed() {
            return Err(OmniError::invalid_argument(format!(
                "Database handle for {} is closed",
                self.name
            )));
        }
        Ok(())
    }
}
