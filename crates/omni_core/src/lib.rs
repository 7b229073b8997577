//! Multi-target database connectivity for Omni Cloud.
//!
//! This crate provides the database layer of the order backend:
//!
//! - **error**: Typed errors callers can branch on
//! - **models**: Connection targets, tunnel specs, SQL values and rows
//! - **services**: Config registry, SSH tunnels, connection pools, query facade
//! - **config**: Environment-sourced configuration
//! - **state**: Composition root with ordered teardown
//! - **logging**: Structured logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

#[cfg(test)]
mod test_support;

pub use config::EnvConfig;
pub use error::{OmniError, OmniResult};
pub use models::{
    ConnectionTarget, DriverKind, HostKeyPolicy, PoolSettings, PoolStatus, Row, SqlValue, SshAuth,
    TunnelKey, TunnelSpec,
};
pub use services::{
    ConfigRegistry, ConnectionFacade, ConnectionPool, DatabaseHandle, DriverSet, PoolManager,
    PooledConnection, SshTunnelOpener, TunnelManager, TunnelOpener,
};
pub use state::OmniState;
