//! Error types for the Omni database layer.
//!
//! Every failure surfaced by the registry, tunnels, pools and the facade is an
//! [`OmniError`] the caller can branch on. Nothing in this crate panics on a
//! database or tunnel error.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type OmniResult<T> = Result<T, OmniError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the database layer.
#[derive(Debug, Error)]
pub enum OmniError {
    /// The requested configuration name was never registered.
    #[error("No database configuration found for: {name}")]
    ConfigNotFound {
        /// Name that was looked up.
        name: String,
    },

    /// Malformed configuration (e.g. an unparseable port in the environment).
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// SSH or database credentials were rejected.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
    },

    /// Host unreachable, refused, or the connect timeout elapsed.
    #[error("Connection error: {message}")]
    Connect {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// The SSH server refused to forward to the remote endpoint.
    #[error("Port forwarding error: {message}")]
    PortForward {
        /// Human-readable error message.
        message: String,
    },

    /// No bindable local port was found for a tunnel.
    #[error("No local port available in {first}..={last}")]
    NoPortAvailable {
        /// First port tried.
        first: u16,
        /// Last port tried.
        last: u16,
    },

    /// The driver or the pool could not be constructed.
    #[error("Pool creation failed: {message}")]
    PoolCreation {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// No connection became free before the pool's connection timeout.
    #[error("Pool exhausted: {message}")]
    PoolExhausted {
        /// Human-readable error message.
        message: String,
        /// Number of tasks waiting for connections when the timeout hit.
        waiting: usize,
    },

    /// The pool was closed while the caller was using it.
    #[error("Pool closed: {config_name}")]
    PoolClosed {
        /// Configuration the pool belonged to.
        config_name: String,
    },

    /// A caller-supplied table or column name failed sanitization.
    #[error("Invalid identifier: {identifier:?}")]
    InvalidIdentifier {
        /// The rejected identifier.
        identifier: String,
    },

    /// A raw condition fragment contained a forbidden token.
    #[error("Invalid condition: {condition:?}")]
    InvalidCondition {
        /// The rejected condition text.
        condition: String,
    },

    /// Argument shape is wrong (empty conditions, parameter count mismatch...).
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Human-readable error message.
        message: String,
    },

    /// A read statement failed.
    #[error("Query failed ({intent}): {message}")]
    QueryFailed {
        /// What the caller was trying to do; never the raw SQL.
        intent: String,
        /// Driver error message.
        message: String,
        /// Database error code, when the driver reports one.
        code: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A write statement failed.
    #[error("Update failed ({intent}): {message}")]
    UpdateFailed {
        /// What the caller was trying to do; never the raw SQL.
        intent: String,
        /// Driver error message.
        message: String,
        /// Database error code, when the driver reports one.
        code: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl OmniError {
    // ========== Constructors ==========

    /// Create a config-not-found error.
    pub fn config_not_found(name: impl Into<String>) -> Self {
        Self::ConfigNotFound { name: name.into() }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create an authentication error with the default hint.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check username and password".to_string()),
        }
    }

    /// Create an authentication error with a custom hint.
    pub fn authentication_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Authentication { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a connect error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect { message: message.into(), source: None }
    }

    /// Create a connect error with source.
    pub fn connect_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connect { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a port-forwarding error.
    pub fn port_forward(message: impl Into<String>) -> Self {
        Self::PortForward { message: message.into() }
    }

    /// Create a no-port-available error for the scanned range.
    pub fn no_port_available(first: u16, last: u16) -> Self {
        Self::NoPortAvailable { first, last }
    }

    /// Create a pool creation error.
    pub fn pool_creation(message: impl Into<String>) -> Self {
        Self::PoolCreation { message: message.into(), source: None }
    }

    /// Create a pool creation error with source.
    pub fn pool_creation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PoolCreation { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(message: impl Into<String>, waiting: usize) -> Self {
        Self::PoolExhausted { message: message.into(), waiting }
    }

    /// Create an invalid identifier error.
    pub fn invalid_identifier(identifier: impl Into<String>) -> Self {
        Self::InvalidIdentifier { identifier: identifier.into() }
    }

    /// Create an invalid condition error.
    pub fn invalid_condition(condition: impl Into<String>) -> Self {
        Self::InvalidCondition { condition: condition.into() }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Re-label a driver failure as a failed read carrying `intent`.
    ///
    /// Errors that are not driver failures (pool exhaustion, closed pool...)
    /// pass through untouched so callers can still branch on them.
    pub fn into_query_failed(self, intent: impl Into<String>) -> Self {
        match self {
            Self::QueryFailed { message, code, source, .. }
            | Self::UpdateFailed { message, code, source, .. } => {
                Self::QueryFailed { intent: intent.into(), message, code, source }
            }
            other => other,
        }
    }

    /// Re-label a driver failure as a failed write carrying `intent`.
    pub fn into_update_failed(self, intent: impl Into<String>) -> Self {
        match self {
            Self::QueryFailed { message, code, source, .. }
            | Self::UpdateFailed { message, code, source, .. } => {
                Self::UpdateFailed { intent: intent.into(), message, code, source }
            }
            other => other,
        }
    }

    // ========== Methods ==========

    /// Check if this error means the name was never registered.
    pub fn is_config_not_found(&self) -> bool {
        matches!(self, Self::ConfigNotFound { .. })
    }

    /// Check if this error is a tunnel establishment failure.
    pub fn is_tunnel_failure(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::Connect { .. }
                | Self::PortForward { .. }
                | Self::NoPortAvailable { .. }
        )
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } | Self::Config { .. } => "Config",
            Self::Authentication { .. } => "Authentication",
            Self::Connect { .. } => "Connection",
            Self::PortForward { .. } | Self::NoPortAvailable { .. } => "Tunnel",
            Self::PoolCreation { .. } | Self::PoolExhausted { .. } | Self::PoolClosed { .. } => {
                "Pool"
            }
            Self::InvalidIdentifier { .. }
            | Self::InvalidCondition { .. }
            | Self::InvalidArgument { .. } => "Validation",
            Self::QueryFailed { .. } => "Query",
            Self::UpdateFailed { .. } => "Update",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get an actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::ConfigNotFound { .. } => {
                Some("Register the configuration or set its environment variables")
            }
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::Connect { .. } => Some("Check that the host is running and reachable"),
            Self::PortForward { .. } => Some("The SSH server may not allow TCP forwarding"),
            Self::NoPortAvailable { .. } => Some("Free a local port or set a different SSH_LOCAL_PORT"),
            Self::PoolExhausted { .. } => Some("Release held connections or raise the pool size"),
            Self::InvalidIdentifier { .. } => {
                Some("Identifiers may only contain letters, digits and underscores")
            }
            _ => None,
        }
    }

    /// Get the database error code (if the driver reported one).
    pub fn db_code(&self) -> Option<&str> {
        match self {
            Self::QueryFailed { code, .. } | Self::UpdateFailed { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to OmniError.
///
/// Statement errors become `QueryFailed` with a generic intent; callers
/// re-label them with [`OmniError::into_query_failed`] or
/// [`OmniError::into_update_failed`].
impl From<tokio_postgres::Error> for OmniError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();
            return match code_str {
                "28P01" | "28000" => OmniError::Authentication {
                    message,
                    hint: Some("Invalid database credentials".to_string()),
                },
                _ if code_str.starts_with("08") => {
                    OmniError::Connect { message, source: Some(Box::new(err)) }
                }
                _ => OmniError::QueryFailed {
                    intent: "statement".to_string(),
                    message,
                    code: Some(code_str.to_string()),
                    source: Some(Box::new(err)),
                },
            };
        }

        if err.is_closed() {
            return OmniError::Connect {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        OmniError::Connect { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from sqlx::Error to OmniError.
impl From<sqlx::Error> for OmniError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|c| c.into_owned());
                // MySQL 1045: access denied for user
                if code.as_deref() == Some("28000") || message.contains("Access denied") {
                    return OmniError::authentication_with_hint(
                        message,
                        "Invalid database credentials",
                    );
                }
                OmniError::QueryFailed {
                    intent: "statement".to_string(),
                    message,
                    code,
                    source: None,
                }
            }
            sqlx::Error::Io(io) => OmniError::connect_with_source(io.to_string(), io),
            sqlx::Error::Tls(e) => OmniError::Connect { message: e.to_string(), source: Some(e) },
            sqlx::Error::PoolTimedOut => OmniError::pool_exhausted("Timed out", 0),
            other => OmniError::QueryFailed {
                intent: "statement".to_string(),
                message: other.to_string(),
                code: None,
                source: Some(Box::new(other)),
            },
        }
    }
}

/// Convert from std::io::Error to OmniError.
impl From<std::io::Error> for OmniError {
    fn from(err: std::io::Error) -> Self {
        OmniError::Connect { message: err.to_string(), source: Some(Box::new(err)) }
    }
}
