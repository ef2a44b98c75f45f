//! Structured error types for fleetdb-core.
//!
//! Origin-side errors (`Configuration`, `ConnectionTimeout`, `Statement`,
//! `ShutDown`, `Driver`) are returned to whoever issued the statement.
//! `Replication`, `Credential` and `PoolShutdown` only ever reach logs and the
//! replication observer.

use std::time::Duration;
use thiserror::Error;

use crate::types::InstanceId;

/// Main error type for fleetdb-core operations
#[derive(Error, Debug)]
pub enum DataError {
    /// Missing or invalid configuration (no URL for an instance, no relay identity, bad config file)
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Pool exhausted past its connect timeout
    #[error("Timed out after {timeout:?} waiting for a pooled connection")]
    ConnectionTimeout { timeout: Duration },

    /// The database rejected the statement
    #[error("Statement rejected{}: {message}", sqlstate_suffix(.code))]
    Statement {
        message: String,
        code: Option<String>,
    },

    /// A relay call failed for one replication target
    #[error("Replication to instance {target} failed: {reason}")]
    Replication { target: InstanceId, reason: String },

    /// The credential issuer failed or rejected the token exchange
    #[error("Credential error: {reason}")]
    Credential { reason: String },

    /// Closing one pool failed during shutdown
    #[error("Failed to close pool for {url}: {reason}")]
    PoolShutdown { url: String, reason: String },

    /// The pool registry has been shut down
    #[error("Pool registry is shut down")]
    ShutDown,

    /// Any other driver or transport failure
    #[error("Database driver error: {source}")]
    Driver {
        #[source]
        source: sqlx::Error,
    },
}

fn sqlstate_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" ({c})"))
        .unwrap_or_default()
}

/// Result type alias for fleetdb-core operations
pub type DataResult<T> = std::result::Result<T, DataError>;

impl DataError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a statement error without a SQLSTATE code
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            code: None,
        }
    }

    /// Create a replication error for one target
    pub fn replication(target: InstanceId, reason: impl Into<String>) -> Self {
        Self::Replication {
            target,
            reason: reason.into(),
        }
    }

    /// Create a credential error
    pub fn credential(reason: impl Into<String>) -> Self {
        Self::Credential {
            reason: reason.into(),
        }
    }

    /// Create a pool shutdown error
    pub fn pool_shutdown(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PoolShutdown {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may reasonably retry the same call
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionTimeout { .. })
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => Self::Statement {
                message: db.message().to_string(),
                code: db.code().map(|c| c.into_owned()),
            },
            sqlx::Error::PoolClosed => Self::ShutDown,
            other => Self::Driver { source: other },
        }
    }
}
