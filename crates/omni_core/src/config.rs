//! Environment-sourced configuration.
//!
//! The default configuration (`nickfury`) reads unprefixed variables such as
//! `DB_HOST` and `SSH_HOST`. Additional configurations are listed in
//! `OMNI_DATABASES` and read the same variables prefixed with the upper-cased
//! name, e.g. `CHANDLER_DB_HOST`.
//!
//! A configuration missing a required variable is skipped, never fatal, so
//! lookups against it fail with `ConfigNotFound`.

use crate::error::{OmniError, OmniResult};
use crate::models::{
    ConnectionTarget, DriverKind, HostKeyPolicy, PoolSettings, SshAuth, TunnelSpec,
};
use crate::services::registry::ConfigRegistry;
use crate::services::ssh::DEFAULT_CONNECT_TIMEOUT;
use crate::services::tunnel::DEFAULT_BASE_PORT;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Name of the configuration read from unprefixed variables.
pub const DEFAULT_CONFIG_NAME: &str = "nickfury";

/// Comma-separated list of additional configuration names.
pub const DATABASES_ENV: &str = "OMNI_DATABASES";

/// Everything read from the environment at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Configurations that had every required variable
    pub targets: Vec<(String, ConnectionTarget)>,
    /// Configurations that were skipped, with the reason
    pub skipped: Vec<(String, String)>,
    /// Pool tunables applied to every pool
    pub pool: PoolSettings,
    /// Bound on SSH connect plus authentication
    pub ssh_connect_timeout: Duration,
}

impl EnvConfig {
    /// Read the process environment.
    pub fn from_env() -> Self {
        Self::load(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`.
    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut targets = Vec::new();
        let mut skipped = Vec::new();

        for name in config_names(&lookup) {
            let prefix = env_prefix(&name);
            match target_from_env(&prefix, &lookup) {
                Ok(Some(target)) => targets.push((name, target)),
                Ok(None) => {
                    tracing::warn!(
                        config_name = %name,
                        "Missing required variables, configuration not registered"
                    );
                    skipped.push((name, "missing required variables".to_string()));
                }
                Err(e) => {
                    tracing::warn!(config_name = %name, error = %e, "Invalid configuration skipped");
                    skipped.push((name, e.to_string()));
                }
            }
        }

        let pool = pool_settings(&lookup).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid pool settings, using defaults");
            PoolSettings::default()
        });
        let ssh_connect_timeout = parse_var(&lookup, "OMNI_SSH_CONNECT_TIMEOUT_SECS")
            .map(|secs| secs.map(Duration::from_secs).unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Invalid SSH connect timeout, using default");
                DEFAULT_CONNECT_TIMEOUT
            });

        Self { targets, skipped, pool, ssh_connect_timeout }
    }

    /// Register every loaded configuration.
    pub fn register_into(&self, registry: &ConfigRegistry) {
        for (name, target) in &self.targets {
            registry.register(name.clone(), target.clone());
        }
        tracing::info!(
            registered = self.targets.len(),
            skipped = self.skipped.len(),
            "Database configurations loaded from environment"
        );
    }
}

/// `nickfury` first, then each distinct name from `OMNI_DATABASES`.
fn config_names(lookup: &impl Fn(&str) -> Option<String>) -> Vec<String> {
    let mut names = vec![DEFAULT_CONFIG_NAME.to_string()];
    if let Some(list) = lookup(DATABASES_ENV) {
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Variable prefix for a configuration name.
pub fn env_prefix(name: &str) -> String {
    if name == DEFAULT_CONFIG_NAME {
        return String::new();
    }
    let mut prefix: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    prefix.push('_');
    prefix
}

/// Build the target for one prefix.
///
/// Returns `Ok(None)` when a required variable is missing and `Err` when a
/// present variable is malformed.
pub fn target_from_env(
    prefix: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> OmniResult<Option<ConnectionTarget>> {
    let raw = |key: &str| lookup(&format!("{prefix}{key}")).filter(|v| !v.is_empty());
    let get = |key: &str| raw(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let number = |key: &str| parse_var::<u16>(lookup, &format!("{prefix}{key}"));

    let driver = match get("DB_DRIVER") {
        Some(value) => DriverKind::parse(&value).ok_or_else(|| {
            OmniError::config(format!("{prefix}DB_DRIVER: unknown driver {value:?}"))
        })?,
        None => DriverKind::default(),
    };

    let (Some(host), Some(database), Some(username), Some(password)) =
        (get("DB_HOST"), get("DB_NAME"), get("DB_USER"), raw("DB_PASSWORD"))
    else {
        return Ok(None);
    };
    let port = number("DB_PORT")?.unwrap_or(driver.default_port());

    let mut target =
        ConnectionTarget::new(driver, host.clone(), database, username, password).with_port(port);

    if let Some(ssh_host) = get("SSH_HOST") {
        let Some(ssh_user) = get("SSH_USER") else {
            return Ok(None);
        };
        let remote_host = get("SSH_REMOTE_HOST").unwrap_or(host);
        let spec = TunnelSpec::new(ssh_host, ssh_user, "", remote_host, port)
            .with_ssh_port(number("SSH_PORT")?.unwrap_or(22))
            .with_local_port(number("SSH_LOCAL_PORT")?.unwrap_or(DEFAULT_BASE_PORT));

        let spec = match (get("SSH_KEY_PATH"), raw("SSH_PASSWORD")) {
            (Some(path), _) => spec.with_key(PathBuf::from(path), raw("SSH_KEY_PASSPHRASE")),
            (None, Some(password)) => TunnelSpec {
                auth: SshAuth::Password { password },
                ..spec
            },
            (None, None) => return Ok(None),
        };

        let strict = match get("SSH_STRICT_HOST_KEY_CHECKING") {
            Some(value) => parse_bool(&value).ok_or_else(|| {
                OmniError::config(format!(
                    "{prefix}SSH_STRICT_HOST_KEY_CHECKING: expected a boolean, got {value:?}"
                ))
            })?,
            None => false,
        };
        let spec = if strict {
            spec.with_host_key_policy(HostKeyPolicy::Strict {
                known_hosts: get("SSH_KNOWN_HOSTS").map(PathBuf::from),
            })
        } else {
            spec
        };

        target = target.with_tunnel(spec);
    }

    Ok(Some(target))
}

/// Pool tunables from `OMNI_POOL_*` and `OMNI_QUERY_TIMEOUT_SECS`.
pub fn pool_settings(lookup: &impl Fn(&str) -> Option<String>) -> OmniResult<PoolSettings> {
    let defaults = PoolSettings::default();
    let secs = |key: &str, default: Duration| -> OmniResult<Duration> {
        Ok(parse_var::<u64>(lookup, key)?.map(Duration::from_secs).unwrap_or(default))
    };

    let max_size = parse_var::<usize>(lookup, "OMNI_POOL_MAX_SIZE")?.unwrap_or(defaults.max_size);
    if max_size == 0 {
        return Err(OmniError::config("OMNI_POOL_MAX_SIZE must be at least 1"));
    }
    let min_idle = parse_var::<usize>(lookup, "OMNI_POOL_MIN_IDLE")?
        .unwrap_or(defaults.min_idle)
        .min(max_size);

    Ok(PoolSettings {
        max_size,
        min_idle,
        connection_timeout: secs("OMNI_POOL_CONNECTION_TIMEOUT_SECS", defaults.connection_timeout)?,
        idle_timeout: secs("OMNI_POOL_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
        max_lifetime: secs("OMNI_POOL_MAX_LIFETIME_SECS", defaults.max_lifetime)?,
        query_timeout: secs("OMNI_QUERY_TIMEOUT_SECS", defaults.query_timeout)?,
        ..defaults
    })
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> OmniResult<Option<T>> {
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| OmniError::config(format!("{key}: invalid number {value:?}"))),
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}
