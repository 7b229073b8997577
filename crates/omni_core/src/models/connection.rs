//! Connection targets, tunnel specs, and pool tunables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Database driver a target speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// MySQL / MariaDB
    #[default]
    MySql,
    /// PostgreSQL
    Postgres,
}

impl DriverKind {
    /// Convert to the driver identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Parse a driver identifier. Unknown identifiers yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            _ => None,
        }
    }

    /// Default server port for the driver.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the SSH client authenticates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "method")]
pub enum SshAuth {
    /// Password authentication
    Password {
        /// SSH password
        password: String,
    },
    /// Private key file authentication
    Key {
        /// Path to the private key
        path: PathBuf,
        /// Passphrase for an encrypted key
        passphrase: Option<String>,
    },
}

impl SshAuth {
    /// Convert to string representation for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Key { .. } => "key",
        }
    }
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.write_str("Password { .. }"),
            Self::Key { path, .. } => f.debug_struct("Key").field("path", path).finish_non_exhaustive(),
        }
    }
}

/// Server host key verification policy.
///
/// `AcceptAny` mirrors the long-standing behaviour for internal bastions;
/// `Strict` checks the key against a known_hosts file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    /// Accept any server key
    #[default]
    AcceptAny,
    /// Require the key to be present in known_hosts
    Strict {
        /// Custom known_hosts file (defaults to ~/.ssh/known_hosts)
        known_hosts: Option<PathBuf>,
    },
}

/// Parameters for reaching a database through an SSH port-forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// SSH server hostname
    pub ssh_host: String,
    /// SSH server port (default 22)
    pub ssh_port: u16,
    /// SSH username
    pub ssh_user: String,
    /// Authentication method
    pub auth: SshAuth,
    /// Database host as seen from the SSH server
    pub remote_host: String,
    /// Database port as seen from the SSH server
    pub remote_port: u16,
    /// Local port to try first
    pub preferred_local_port: Option<u16>,
    /// Host key verification policy
    pub host_key_policy: HostKeyPolicy,
}

impl TunnelSpec {
    /// Create a tunnel spec with password authentication.
    pub fn new(
        ssh_host: impl Into<String>,
        ssh_user: impl Into<String>,
        password: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port: 22,
            ssh_user: ssh_user.into(),
            auth: SshAuth::Password { password: password.into() },
            remote_host: remote_host.into(),
            remote_port,
            preferred_local_port: None,
            host_key_policy: HostKeyPolicy::default(),
        }
    }

    /// Set the SSH port.
    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Switch to key-based authentication.
    pub fn with_key(mut self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.auth = SshAuth::Key { path: path.into(), passphrase };
        self
    }

    /// Set the preferred local port.
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.preferred_local_port = Some(port);
        self
    }

    /// Set the host key policy.
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// Identity of the physical tunnel this spec describes.
    pub fn key(&self) -> TunnelKey {
        TunnelKey {
            ssh_host: self.ssh_host.clone(),
            ssh_port: self.ssh_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
        }
    }
}

/// Identity of one forwarded session.
///
/// Two configurations pointing at the same bastion and remote endpoint share
/// one tunnel regardless of their names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelKey {
    /// SSH server hostname
    pub ssh_host: String,
    /// SSH server port
    pub ssh_port: u16,
    /// Remote database host
    pub remote_host: String,
    /// Remote database port
    pub remote_port: u16,
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.ssh_host, self.ssh_port, self.remote_host, self.remote_port
        )
    }
}

/// One logical database endpoint.
///
/// When `tunnel` is set and the target has been resolved by the pool manager,
/// `host`/`port` point at the loopback end of the tunnel; the real remote
/// endpoint lives only inside the [`TunnelSpec`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name; empty means server-level with no default schema
    pub database: String,
    /// Login username
    pub username: String,
    /// Login password
    pub password: String,
    /// Driver used to talk to the server
    pub driver: DriverKind,
    /// Optional SSH tunnel settings
    pub tunnel: Option<TunnelSpec>,
}

impl ConnectionTarget {
    /// Create a target with the driver's default port.
    pub fn new(
        driver: DriverKind,
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: driver.default_port(),
            database: database.into(),
            username: username.into(),
            password: password.into(),
            driver,
            tunnel: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Attach an SSH tunnel.
    pub fn with_tunnel(mut self, tunnel: TunnelSpec) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Whether connecting requires an SSH tunnel.
    pub fn requires_tunnel(&self) -> bool {
        self.tunnel.is_some()
    }

    /// The target as seen through a tunnel bound on `local_port`.
    pub fn through_tunnel(&self, local_port: u16) -> Self {
        Self { host: "localhost".to_string(), port: local_port, ..self.clone() }
    }

    /// The database name, or `None` for a server-level target.
    pub fn database_name(&self) -> Option<&str> {
        if self.database.is_empty() {
            None
        } else {
            Some(&self.database)
        }
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.driver, self.username, self.host, self.port, self.database
        )
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"*****")
            .field("driver", &self.driver)
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

/// Pool sizing and eviction knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum live connections
    pub max_size: usize,
    /// Connections kept warm when idle
    pub min_idle: usize,
    /// Longest a caller waits for a connection (also bounds connect)
    pub connection_timeout: Duration,
    /// Idle connections older than this are evicted
    pub idle_timeout: Duration,
    /// Connections older than this are evicted regardless of use
    pub max_lifetime: Duration,
    /// How often the maintenance task runs
    pub maintenance_interval: Duration,
    /// Upper bound for a single statement
    pub query_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 2,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(10 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(30),
            query_timeout: Duration::from_secs(60),
        }
    }
}

/// Connection pool status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Maximum pool capacity
    pub max_size: usize,
    /// Current connections (idle + active)
    pub size: usize,
    /// Idle connections
    pub available: usize,
    /// Tasks waiting for connections
    pub waiting: usize,
}

impl PoolStatus {
    /// Get the number of active (in-use) connections.
    pub fn active(&self) -> usize {
        self.size.saturating_sub(self.available)
    }

    /// Check if the pool is saturated.
    pub fn is_saturated(&self) -> bool {
        self.available == 0 && self.size >= self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunneled() -> ConnectionTarget {
        ConnectionTarget::new(DriverKind::MySql, "10.0.0.5", "nickfury", "app", "secret")
            .with_tunnel(TunnelSpec::new("bastion", "ubuntu", "pw", "10.0.0.5", 3306))
    }

    #[test]
    fn test_through_tunnel_rewrites_only_endpoint() {
        let target = tunneled();
        let effective = target.through_tunnel(3310);

        assert_eq!(effective.host, "localhost");
        assert_eq!(effective.port, 3310);
        assert_eq!(effective.database, target.database);
        assert_eq!(effective.username, target.username);
        assert_eq!(effective.tunnel, target.tunnel);
    }

    #[test]
    fn test_tunnel_key_ignores_credentials() {
        let a = TunnelSpec::new("bastion", "alice", "pw1", "db", 3306);
        let b = TunnelSpec::new("bastion", "bob", "pw2", "db", 3306).with_local_port(4000);
        let c = TunnelSpec::new("bastion", "alice", "pw1", "db", 3307);

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().to_string(), "bastion:22->db:3306");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", tunneled());
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("\"pw\""));
        assert!(rendered.contains("*****"));
    }

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!(DriverKind::parse("MySQL"), Some(DriverKind::MySql));
        assert_eq!(DriverKind::parse("postgresql"), Some(DriverKind::Postgres));
        assert_eq!(DriverKind::parse("oracle"), None);
        assert_eq!(DriverKind::Postgres.default_port(), 5432);
    }

    #[test]
    fn test_empty_database_is_server_level() {
        let target = ConnectionTarget::new(DriverKind::MySql, "h", "", "u", "p");
        assert_eq!(target.database_name(), None);
        assert_eq!(target.port, 3306);
    }

    #[test]
    fn test_pool_settings_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_size, 10);
        assert_eq!(settings.min_idle, 2);
        assert_eq!(settings.connection_timeout, Duration::from_secs(30));
        assert_eq!(settings.idle_timeout, Duration::from_secs(600));
        assert_eq!(settings.max_lifetime, Duration::from_secs(1800));
    }
}
