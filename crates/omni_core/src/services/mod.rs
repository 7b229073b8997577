//! Backend services for the Omni database layer.
//!
//! This module contains the connectivity stack, leaves first:
//! - `registry` - Named connection targets
//! - `tunnel` - Tunnel session ownership, one session per identity
//! - `ssh` - russh-based tunnel opener
//! - `driver` - MySQL and PostgreSQL drivers
//! - `pool` - Per-configuration connection pools with deadpool
//! - `sql` - Identifier validation and existence-check statements
//! - `facade` - Query, update and existence helpers over the pools

pub mod driver;
pub mod facade;
pub mod pool;
pub mod registry;
pub mod sql;
pub mod ssh;
pub mod tunnel;

pub use driver::{Driver, DriverConnection, DriverSet, MySqlDriver, PostgresDriver};
pub use facade::{ConnectionFacade, DatabaseHandle};
pub use pool::{ConnectionPool, PoolManager, PooledConnection};
pub use registry::ConfigRegistry;
pub use ssh::SshTunnelOpener;
pub use tunnel::{ActiveTunnel, TunnelManager, TunnelOpener};
