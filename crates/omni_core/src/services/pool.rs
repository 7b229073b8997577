//! Per-configuration connection pooling with deadpool.
//!
//! Provides connection management with:
//! - Exactly-once pool creation per configuration name
//! - Tunnel resolution before the pool is built
//! - Connection validation on pool creation
//! - Idle and lifetime eviction, plus a warm floor of idle connections
//! - Bounded waits on pool exhaustion

use crate::error::{OmniError, OmniResult};
use crate::models::{ConnectionTarget, DriverKind, PoolSettings, PoolStatus, Row, SqlValue};
use crate::services::driver::{Driver, DriverConnection, DriverSet};
use crate::services::registry::ConfigRegistry;
use crate::services::tunnel::TunnelManager;

use chrono::{DateTime, Utc};
use deadpool::managed::{
    self, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult, Timeouts,
};
use deadpool::Runtime;
use parking_lot::RwLock;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Test statement run when a pool is created.
const VALIDATION_QUERY: &str = "SELECT 1";

/// Prefix of the synthetic names used by [`PoolManager::connect_direct`].
pub const DIRECT_POOL_PREFIX: &str = "direct_";

/// deadpool manager for one resolved target.
pub struct TargetManager {
    driver: Arc<dyn Driver>,
    target: ConnectionTarget,
    connect_timeout: Duration,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl managed::Manager for TargetManager {
    type Type = Box<dyn DriverConnection>;
    type Error = OmniError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.driver.connect(&self.target, self.connect_timeout).await
    }

    async fn recycle(&self, conn: &mut Self::Type, metrics: &Metrics) -> RecycleResult<OmniError> {
        if metrics.age() >= self.max_lifetime {
            return Err(RecycleError::Backend(OmniError::connect(
                "Connection exceeded its maximum lifetime",
            )));
        }
        if metrics.last_used() >= self.idle_timeout {
            return Err(RecycleError::Backend(OmniError::connect(
                "Connection exceeded the idle timeout",
            )));
        }
        conn.ping().await.map_err(RecycleError::Backend)
    }
}

/// The pool for a single configuration name.
///
/// Holds a snapshot of the effective target taken at creation time.
pub struct ConnectionPool {
    id: Uuid,
    name: String,
    target: ConnectionTarget,
    settings: PoolSettings,
    pool: Pool<TargetManager>,
    maintenance: CancellationToken,
    created_at: DateTime<Utc>,
}

impl ConnectionPool {
    /// Build a pool against `target` and validate it with a test query.
    pub async fn new(
        name: impl Into<String>,
        target: ConnectionTarget,
        driver: Arc<dyn Driver>,
        settings: PoolSettings,
    ) -> OmniResult<Self> {
        let name = name.into();
        let manager = TargetManager {
            driver,
            target: target.clone(),
            connect_timeout: settings.connection_timeout,
            idle_timeout: settings.idle_timeout,
            max_lifetime: settings.max_lifetime,
        };

        let pool = Pool::builder(manager)
            .max_size(settings.max_size.max(1))
            .wait_timeout(Some(settings.connection_timeout))
            .create_timeout(Some(settings.connection_timeout))
            .recycle_timeout(Some(settings.connection_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                OmniError::pool_creation_with_source(format!("Failed to build pool for {name}"), e)
            })?;

        // Validate connectivity before anyone can use the pool
        let validated = async {
            let mut conn = pool.get().await.map_err(|e| map_pool_error(&name, &pool, e))?;
            conn.query(VALIDATION_QUERY, &[]).await
        }
        .await;
        if let Err(e) = validated {
            pool.close();
            return Err(OmniError::pool_creation_with_source(
                format!("Connection validation failed for {name}"),
                e,
            ));
        }

        let maintenance = CancellationToken::new();
        tokio::spawn(maintain(pool.clone(), name.clone(), settings, maintenance.clone()));

        tracing::info!(
            config_name = %name,
            url = %target.display_url(),
            max_size = settings.max_size,
            "Connection pool created successfully"
        );

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            target,
            settings,
            pool,
            maintenance,
            created_at: Utc::now(),
        })
    }

    /// Unique identity of this pool instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration name the pool serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The effective target the pool connects to.
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Settings the pool was built with.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// When this pool was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire a connection, waiting at most the connection timeout.
    pub async fn get(&self) -> OmniResult<PooledConnection> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| map_pool_error(&self.name, &self.pool, e))?;
        Ok(PooledConnection { conn, config_name: self.name.clone() })
    }

    /// Current pool status.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    /// Close the pool. Idle connections are dropped now, checked-out ones
    /// when they are returned.
    pub fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        self.maintenance.cancel();
        self.pool.close();
        tracing::info!(config_name = %self.name, pool_id = %self.id, "Connection pool closed");
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target", &self.target)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}

fn map_pool_error(
    name: &str,
    pool: &Pool<TargetManager>,
    err: PoolError<OmniError>,
) -> OmniError {
    match err {
        PoolError::Backend(e) => e,
        PoolError::Timeout(managed::TimeoutType::Wait) => OmniError::pool_exhausted(
            format!("No connection available for {name} before the timeout"),
            pool.status().waiting,
        ),
        PoolError::Timeout(kind) => {
            OmniError::connect(format!("Timed out ({kind:?}) opening a connection for {name}"))
        }
        PoolError::Closed => OmniError::PoolClosed { config_name: name.to_string() },
        other => OmniError::internal(format!("Pool error for {name}: {other}")),
    }
}

/// Background upkeep: evict expired connections and keep `min_idle` warm.
async fn maintain(
    pool: Pool<TargetManager>,
    name: String,
    settings: PoolSettings,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(settings.maintenance_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if pool.is_closed() {
            break;
        }

        evict_expired(&pool, &settings);
        top_up(&pool, &name, &settings).await;
    }

    tracing::debug!(config_name = %name, "Pool maintenance stopped");
}

/// Drop connections past their lifetime, and idle ones past the idle
/// timeout while the pool is above `min_idle`.
fn evict_expired(pool: &Pool<TargetManager>, settings: &PoolSettings) {
    let surplus = Cell::new(pool.status().size.saturating_sub(settings.min_idle));
    pool.retain(|_, metrics| {
        if metrics.age() >= settings.max_lifetime {
            surplus.set(surplus.get().saturating_sub(1));
            return false;
        }
        if metrics.last_used() >= settings.idle_timeout && surplus.get() > 0 {
            surplus.set(surplus.get() - 1);
            return false;
        }
        true
    });
}

async fn top_up(pool: &Pool<TargetManager>, name: &str, settings: &PoolSettings) {
    let missing = settings.min_idle.saturating_sub(pool.status().size);
    if missing == 0 {
        return;
    }

    // Never queue behind real callers.
    let timeouts = Timeouts {
        wait: Some(Duration::ZERO),
        create: Some(settings.connection_timeout),
        recycle: Some(settings.connection_timeout),
    };
    let mut warmed = Vec::with_capacity(settings.min_idle);
    while pool.status().size < settings.min_idle {
        match pool.timeout_get(&timeouts).await {
            Ok(conn) => warmed.push(conn),
            Err(e) => {
                tracing::debug!(config_name = %name, error = %e, "Could not warm idle connection");
                break;
            }
        }
    }
    tracing::trace!(config_name = %name, warmed = warmed.len(), "Pool topped up");
}

/// A connection checked out of a pool.
///
/// Returns to its pool when dropped.
pub struct PooledConnection {
    conn: Object<TargetManager>,
    config_name: String,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("config_name", &self.config_name)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Configuration name of the pool this connection came from.
    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    /// Execute a query that returns rows.
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<Vec<Row>> {
        self.conn.query(sql, params).await
    }

    /// Execute a statement and return the affected row count.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> OmniResult<u64> {
        self.conn.execute(sql, params).await
    }

    /// Check the connection is alive.
    pub async fn ping(&mut self) -> OmniResult<()> {
        self.conn.ping().await
    }

    /// Remove the connection from its pool and close it, for connections
    /// left in an unknown state (e.g. a statement cancelled mid-flight).
    pub fn discard(self) {
        drop(Object::take(self.conn));
    }
}

type PoolSlot = Arc<OnceCell<Arc<ConnectionPool>>>;

/// Owns every pool in the process, keyed by configuration name.
pub struct PoolManager {
    registry: Arc<ConfigRegistry>,
    tunnels: Arc<TunnelManager>,
    drivers: DriverSet,
    settings: PoolSettings,
    pools: RwLock<HashMap<String, PoolSlot>>,
}

impl PoolManager {
    /// Create a manager reading targets from `registry`.
    pub fn new(
        registry: Arc<ConfigRegistry>,
        tunnels: Arc<TunnelManager>,
        drivers: DriverSet,
        settings: PoolSettings,
    ) -> Self {
        Self { registry, tunnels, drivers, settings, pools: RwLock::new(HashMap::new()) }
    }

    /// Pool settings applied to new pools.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Get or create the pool for `name`.
    ///
    /// Tunneled targets get their tunnel first and the pool connects to its
    /// loopback end. Concurrent first use builds exactly one pool; a failed
    /// build leaves nothing cached so the next call retries.
    pub async fn get_pool(&self, name: &str) -> OmniResult<Arc<ConnectionPool>> {
        let target = self.registry.lookup(name)?;

        // One retry covers a pool whose tunnel moved since it was cached.
        for _ in 0..2 {
            let effective = match &target.tunnel {
                Some(spec) => {
                    let local_port = self.tunnels.ensure_tunnel(spec).await?;
                    target.through_tunnel(local_port)
                }
                None => target.clone(),
            };

            let slot = self.slot(name);
            let pool = slot
                .get_or_try_init(|| self.create_pool(name, &effective))
                .await?
                .clone();

            // A close that ran while the pool was being built dropped our slot.
            if !self.is_tracked(name, &slot) {
                tracing::debug!(config_name = %name, "Pool closed while it was being built");
                pool.close();
                return Err(OmniError::PoolClosed { config_name: name.to_string() });
            }

            if !self.is_stale(&pool) {
                return Ok(pool);
            }

            tracing::warn!(config_name = %name, "Cached pool lost its tunnel, rebuilding");
            self.remove_slot(name, &slot);
            pool.close();
        }

        Err(OmniError::connect(format!("Tunnel for {name} closed while building its pool")))
    }

    /// Acquire a connection from the pool for `name`.
    ///
    /// Fails with `PoolExhausted` once the connection timeout elapses.
    pub async fn acquire_connection(&self, name: &str) -> OmniResult<PooledConnection> {
        self.get_pool(name).await?.get().await
    }

    /// Close and forget the pool for `name`. The registry entry stays, so the
    /// next use builds a fresh pool. Unknown names are a no-op.
    pub fn close_pool(&self, name: &str) {
        let slot = self.pools.write().remove(name);
        if let Some(pool) = slot.and_then(|s| s.get().cloned()) {
            pool.close();
        }
    }

    /// Close every pool.
    pub fn close_all(&self) {
        let slots: Vec<(String, PoolSlot)> = self.pools.write().drain().collect();
        let count = slots.iter().filter(|(_, s)| s.initialized()).count();
        for (_, slot) in slots {
            if let Some(pool) = slot.get() {
                pool.close();
            }
        }
        tracing::info!(count, "All connection pools closed");
    }

    /// One-off connection from raw parameters, pooled under a synthetic
    /// `direct_<uuid>` name. Close it with [`PoolManager::close_pool`] using
    /// [`PooledConnection::config_name`].
    pub async fn connect_direct(
        &self,
        host: &str,
        port: u16,
        database: &str,
        username: &str,
        password: &str,
        driver: DriverKind,
    ) -> OmniResult<PooledConnection> {
        let name = format!("{DIRECT_POOL_PREFIX}{}", Uuid::new_v4().simple());
        let target =
            ConnectionTarget::new(driver, host, database, username, password).with_port(port);

        let attempt = async {
            let slot = self.slot(&name);
            let pool = slot.get_or_try_init(|| self.create_pool(&name, &target)).await?;
            if !self.is_tracked(&name, &slot) {
                pool.close();
                return Err(OmniError::PoolClosed { config_name: name.clone() });
            }
            pool.get().await
        }
        .await;

        match attempt {
            Ok(conn) => Ok(conn),
            Err(e) => {
                tracing::warn!(config_name = %name, error = %e, "Direct connection failed");
                self.close_pool(&name);
                Err(e)
            }
        }
    }

    /// The live pool for `name`, without creating one.
    pub fn pool(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools
            .read()
            .get(name)
            .and_then(|slot| slot.get().cloned())
            .filter(|pool| !pool.is_closed())
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.pools
            .read()
            .values()
            .filter(|slot| slot.get().is_some_and(|p| !p.is_closed()))
            .count()
    }

    /// Names with a live pool, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .iter()
            .filter(|(_, slot)| slot.get().is_some_and(|p| !p.is_closed()))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Status of every live pool, sorted by name.
    pub fn statuses(&self) -> Vec<(String, PoolStatus)> {
        let mut statuses: Vec<(String, PoolStatus)> = self
            .pools
            .read()
            .iter()
            .filter_map(|(name, slot)| slot.get().map(|p| (name.clone(), p.clone())))
            .filter(|(_, pool)| !pool.is_closed())
            .map(|(name, pool)| (name, pool.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    async fn create_pool(
        &self,
        name: &str,
        target: &ConnectionTarget,
    ) -> OmniResult<Arc<ConnectionPool>> {
        let driver = self.drivers.get(target.driver)?;
        tracing::debug!(config_name = %name, url = %target.display_url(), "Creating connection pool");
        let pool = ConnectionPool::new(name, target.clone(), driver, self.settings)
            .await
            .map_err(|e| {
                tracing::warn!(config_name = %name, error = %e, "Connection pool creation failed");
                e
            })?;
        Ok(Arc::new(pool))
    }

    /// A pool is stale once closed, or when its tunnel no longer serves the
    /// port it was built against.
    fn is_stale(&self, pool: &ConnectionPool) -> bool {
        if pool.is_closed() {
            return true;
        }
        match &pool.target().tunnel {
            Some(spec) => self.tunnels.local_port(&spec.key()) != Some(pool.target().port),
            None => false,
        }
    }

    /// Atomic get-or-insert of the slot for `name`.
    fn slot(&self, name: &str) -> PoolSlot {
        if let Some(slot) = self.pools.read().get(name) {
            return slot.clone();
        }
        self.pools.write().entry(name.to_string()).or_default().clone()
    }

    /// Whether `slot` is still the one registered for `name`.
    fn is_tracked(&self, name: &str, slot: &PoolSlot) -> bool {
        self.pools.read().get(name).is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn remove_slot(&self, name: &str, slot: &PoolSlot) {
        let mut pools = self.pools.write();
        if pools.get(name).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            pools.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TunnelSpec;
    use crate::test_support::{FakeDriver, FakeOpener};
    use std::time::Instant;

    fn settings() -> PoolSettings {
        PoolSettings {
            min_idle: 0,
            connection_timeout: Duration::from_millis(200),
            ..PoolSettings::default()
        }
    }

    struct Fixture {
        registry: Arc<ConfigRegistry>,
        opener: Arc<FakeOpener>,
        tunnels: Arc<TunnelManager>,
        driver: Arc<FakeDriver>,
        manager: PoolManager,
    }

    fn fixture_with(settings: PoolSettings) -> Fixture {
        let registry = Arc::new(ConfigRegistry::new());
        let opener = Arc::new(FakeOpener::new());
        let tunnels = Arc::new(TunnelManager::new(opener.clone()));
        let driver = Arc::new(FakeDriver::new());
        let drivers = DriverSet::new().with_driver(driver.clone());
        let manager = PoolManager::new(registry.clone(), tunnels.clone(), drivers, settings);
        Fixture { registry, opener, tunnels, driver, manager }
    }

    fn fixture() -> Fixture {
        fixture_with(settings())
    }

    fn direct_target() -> ConnectionTarget {
        ConnectionTarget::new(DriverKind::MySql, "db.internal", "orders", "app", "pw")
    }

    fn tunneled_target() -> ConnectionTarget {
        direct_target()
            .with_tunnel(TunnelSpec::new("bastion", "ubuntu", "pw", "db.internal", 3306).with_local_port(0))
    }

    #[tokio::test]
    async fn test_unknown_name_is_config_not_found() {
        let f = fixture();
        let err = f.manager.get_pool("missing").await.unwrap_err();
        assert!(err.is_config_not_found());
        assert_eq!(f.driver.connects(), 0);
    }

    #[tokio::test]
    async fn test_get_pool_reuses_instance() {
        let f = fixture();
        f.registry.register("main", direct_target());

        let first = f.manager.get_pool("main").await.unwrap();
        let second = f.manager.get_pool("main").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.manager.pool_count(), 1);
        assert_eq!(f.driver.connects(), 1);
    }

    #[tokio::test]
    async fn test_tunneled_pool_connects_through_loopback() {
        let f = fixture();
        f.registry.register("remote", tunneled_target());

        let pool = f.manager.get_pool("remote").await.unwrap();
        let key = tunneled_target().tunnel.unwrap().key();
        let local_port = f.tunnels.local_port(&key).unwrap();

        assert_eq!(pool.target().host, "localhost");
        assert_eq!(pool.target().port, local_port);
        let seen = f.driver.last_target().unwrap();
        assert_eq!((seen.host.as_str(), seen.port), ("localhost", local_port));
        assert_eq!(f.opener.opened(), 1);
    }

    #[tokio::test]
    async fn test_pool_rebuilt_when_tunnel_dies() {
        let f = fixture();
        f.registry.register("remote", tunneled_target());
        let first = f.manager.get_pool("remote").await.unwrap();

        f.opener.kill_all();
        let second = f.manager.get_pool("remote").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert_eq!(f.opener.opened(), 2);
    }

    #[tokio::test]
    async fn test_registry_overwrite_does_not_touch_live_pool() {
        let f = fixture();
        f.registry.register("main", direct_target());
        let pool = f.manager.get_pool("main").await.unwrap();

        let mut moved = direct_target();
        moved.host = "elsewhere".to_string();
        f.registry.register("main", moved);

        let again = f.manager.get_pool("main").await.unwrap();
        assert!(Arc::ptr_eq(&pool, &again));
        assert_eq!(again.target().host, "db.internal");
    }

    #[tokio::test]
    async fn test_close_pool_then_get_builds_new_instance() {
        let f = fixture();
        f.registry.register("main", direct_target());
        let first = f.manager.get_pool("main").await.unwrap();

        f.manager.close_pool("main");
        f.manager.close_pool("main");
        assert!(first.is_closed());
        assert_eq!(f.manager.pool_count(), 0);
        assert!(f.registry.contains("main"));

        let second = f.manager.get_pool("main").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_failed_creation_is_pool_creation_and_retried() {
        let f = fixture();
        f.registry.register("main", direct_target());
        f.driver.fail_next(OmniError::connect("refused"));

        let err = f.manager.get_pool("main").await.unwrap_err();
        assert!(matches!(err, OmniError::PoolCreation { .. }), "got {err:?}");
        assert_eq!(f.manager.pool_count(), 0);

        f.manager.get_pool("main").await.unwrap();
        assert_eq!(f.manager.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_driver_is_pool_creation() {
        let f = fixture();
        let mut target = direct_target();
        target.driver = DriverKind::Postgres;
        f.registry.register("pg", target);

        let err = f.manager.get_pool("pg").await.unwrap_err();
        assert!(matches!(err, OmniError::PoolCreation { .. }));
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out_as_exhausted() {
        let f = fixture_with(PoolSettings { max_size: 1, ..settings() });
        f.registry.register("main", direct_target());

        let _held = f.manager.acquire_connection("main").await.unwrap();
        let started = Instant::now();
        let err = f.manager.acquire_connection("main").await.unwrap_err();

        assert!(matches!(err, OmniError::PoolExhausted { .. }), "got {err:?}");
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let f = fixture();
        f.registry.register("main", direct_target());

        drop(f.manager.acquire_connection("main").await.unwrap());
        drop(f.manager.acquire_connection("main").await.unwrap());

        assert_eq!(f.driver.connects(), 1);
        let status = f.manager.pool("main").unwrap().status();
        assert_eq!(status.size, 1);
        assert_eq!(status.available, 1);
    }

    #[tokio::test]
    async fn test_expired_connection_is_replaced_on_checkout() {
        let f = fixture_with(PoolSettings { max_lifetime: Duration::from_millis(50), ..settings() });
        f.registry.register("main", direct_target());

        drop(f.manager.acquire_connection("main").await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(f.manager.acquire_connection("main").await.unwrap());

        assert_eq!(f.driver.connects(), 2);
    }

    #[tokio::test]
    async fn test_maintenance_warms_min_idle() {
        let f = fixture_with(PoolSettings { min_idle: 2, ..settings() });
        f.registry.register("main", direct_target());
        let pool = f.manager.get_pool("main").await.unwrap();

        for _ in 0..50 {
            if pool.status().size >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.status().size, 2);
    }

    #[tokio::test]
    async fn test_debug_output_redacts_credentials() {
        let f = fixture();
        f.registry.register("main", direct_target());

        let pool = f.manager.get_pool("main").await.unwrap();
        let conn = pool.get().await.unwrap();

        let rendered = format!("{pool:?} {conn:?}");
        assert!(rendered.contains("main"));
        assert!(rendered.contains("db.internal"));
        assert!(!rendered.contains("\"pw\""));
    }

    #[tokio::test]
    async fn test_close_all_leaves_no_pools() {
        let f = fixture();
        f.registry.register("a", direct_target());
        f.registry.register("b", direct_target());
        let a = f.manager.get_pool("a").await.unwrap();
        f.manager.get_pool("b").await.unwrap();
        assert_eq!(f.manager.names(), vec!["a".to_string(), "b".to_string()]);

        f.manager.close_all();

        assert_eq!(f.manager.pool_count(), 0);
        assert!(f.manager.statuses().is_empty());
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_connect_direct_uses_synthetic_name() {
        let f = fixture();
        let conn = f
            .manager
            .connect_direct("10.0.0.9", 3310, "", "app", "pw", DriverKind::MySql)
            .await
            .unwrap();

        assert!(conn.config_name().starts_with(DIRECT_POOL_PREFIX));
        assert_eq!(f.manager.pool_count(), 1);
        assert_eq!(f.driver.last_target().unwrap().port, 3310);

        let name = conn.config_name().to_string();
        drop(conn);
        f.manager.close_pool(&name);
        assert_eq!(f.manager.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_direct_cleans_up_on_failure() {
        let f = fixture();
        f.driver.fail_next(OmniError::connect("refused"));

        let result = f
            .manager
            .connect_direct("10.0.0.9", 3306, "orders", "app", "pw", DriverKind::MySql)
            .await;

        assert!(result.is_err());
        assert_eq!(f.manager.pool_count(), 0);
        assert!(f.manager.names().is_empty());
    }
}
