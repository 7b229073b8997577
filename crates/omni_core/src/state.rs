//! Process-scoped composition root.
//!
//! [`OmniState`] constructs the registry, tunnel manager, pool manager and
//! facade once and hands them out explicitly. There is no global instance;
//! the owning process calls [`OmniState::shutdown`] on its way out.

use crate::config::EnvConfig;
use crate::error::OmniResult;
use crate::models::{PoolSettings, PoolStatus};
use crate::services::{
    ConfigRegistry, ConnectionFacade, DriverSet, PoolManager, SshTunnelOpener, TunnelManager,
    TunnelOpener,
};

use std::sync::Arc;

/// Owns the database layer for one process.
pub struct OmniState {
    registry: Arc<ConfigRegistry>,
    tunnels: Arc<TunnelManager>,
    pools: Arc<PoolManager>,
    facade: ConnectionFacade,
}

impl OmniState {
    /// Wire the layer from explicit parts.
    pub fn new(
        registry: Arc<ConfigRegistry>,
        opener: Arc<dyn TunnelOpener>,
        drivers: DriverSet,
        settings: PoolSettings,
    ) -> Self {
        let tunnels = Arc::new(TunnelManager::new(opener));
        let pools = Arc::new(PoolManager::new(registry.clone(), tunnels.clone(), drivers, settings));
        let facade = ConnectionFacade::new(pools.clone());

        tracing::info!(
            configs = registry.len(),
            max_pool_size = settings.max_size,
            "OmniState initialized"
        );

        Self { registry, tunnels, pools, facade }
    }

    /// Wire the layer from environment configuration, with the SSH opener
    /// and the MySQL and PostgreSQL drivers.
    pub fn from_env_config(config: &EnvConfig) -> Self {
        let registry = Arc::new(ConfigRegistry::new());
        config.register_into(&registry);
        let opener = SshTunnelOpener::new().with_connect_timeout(config.ssh_connect_timeout);
        Self::new(registry, Arc::new(opener), DriverSet::with_defaults(), config.pool)
    }

    // ========== Service Accessors ==========

    /// Get the configuration registry.
    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    /// Get the tunnel manager.
    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Get the pool manager.
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Get the connection facade.
    pub fn facade(&self) -> &ConnectionFacade {
        &self.facade
    }

    /// Get status of all connection pools.
    pub fn all_pool_statuses(&self) -> Vec<(String, PoolStatus)> {
        self.pools.statuses()
    }

    // ========== Lifecycle ==========

    /// Run the test query against every registered configuration.
    ///
    /// Failures are reported per name and never stop the remaining checks.
    pub async fn check_all(&self) -> Vec<(String, OmniResult<()>)> {
        let mut results = Vec::new();
        for name in self.registry.names() {
            let result = self.facade.query(&name, "SELECT 1", &[]).await.map(|_| ());
            match &result {
                Ok(()) => tracing::info!(config_name = %name, "Database reachable"),
                Err(e) => tracing::warn!(
                    config_name = %name,
                    category = e.category(),
                    error = %e,
                    hint = e.hint().unwrap_or_default(),
                    "Database check failed"
                ),
            }
            results.push((name, result));
        }
        results
    }

    /// Ordered teardown: pools first, then the tunnels they ride on.
    ///
    /// Each step logs its own failures and never aborts the next.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down database layer");
        self.pools.close_all();
        self.tunnels.close_all().await;
    }
}
