//! Daemon error types.

use dexfin_connectors::ConnectorError;
use thiserror::Error;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Connector error
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
