//! Error types shared by every postern crate.
//!
//! Configuration and binding problems are startup-only failures: the
//! supervisor reports them and exits without leaving anything half running.

use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

/// Invalid or unusable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration file could be located.
    #[error("No configuration file found. Tried:\n{0}")]
    NotFound(String),

    /// The configuration file exists but could not be read.
    #[error("Failed to read config from {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A value is present but not acceptable.
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// Neither ingestion nor delivery is enabled.
    #[error("Both the frontend and the delivery worker are disabled, there is nothing to do")]
    NothingToDo,
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A listen endpoint could not be bound.
#[derive(Debug, Error)]
pub enum BindError {
    /// Binding a single endpoint failed.
    #[error("Failed to bind listener to {address}: {source}")]
    Failed {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Every configured endpoint failed to bind.
    #[error("None of the {0} configured endpoints could be bound")]
    NoneBound(usize),
}

/// Errors raised while validating protocol arguments.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A required configuration field is missing.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A configuration value is invalid.
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// I/O error during validation (e.g. missing TLS material).
    #[error("I/O error during validation: {0}")]
    Io(#[from] io::Error),
}

/// Errors that end a single session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Protocol error occurred during session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,

    /// Session timed out.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_classification() {
        assert!(SessionError::Shutdown.is_shutdown());
        assert!(!SessionError::Shutdown.is_client_error());
        assert!(SessionError::Timeout(30).is_client_error());
        assert!(SessionError::Protocol("bad".to_string()).is_client_error());
    }

    #[test]
    fn bind_error_display() {
        let err = BindError::Failed {
            address: "127.0.0.1:25".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to bind listener to 127.0.0.1:25: address in use"
        );
        assert_eq!(
            BindError::NoneBound(2).to_string(),
            "None of the 2 configured endpoints could be bound"
        );
    }

    #[test]
    fn config_error_helper() {
        let err = ConfigError::invalid("queue.msg_timeout", "must be greater than zero");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for queue.msg_timeout: must be greater than zero"
        );
    }
}
