//! Data models for the database layer.
//!
//! - `connection` - ConnectionTarget, TunnelSpec, TunnelKey, PoolSettings, PoolStatus
//! - `value` - SqlValue and Row

pub mod connection;
pub mod value;

pub use connection::{
    ConnectionTarget, DriverKind, HostKeyPolicy, PoolSettings, PoolStatus, SshAuth, TunnelKey,
    TunnelSpec,
};
pub use value::{Row, SqlValue};
