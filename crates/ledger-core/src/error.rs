//! Error types for ledger-core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using ledger-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ledger-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input, rejected before any write
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network failure talking to the remote service; retried next cycle
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The sync mutex could not be acquired in time
    #[error("Timed out after {0:?} waiting for the sync lock")]
    LockTimeout(Duration),

    /// Entry not found
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote payload failed strict validation
    #[error("Invalid remote payload: {0}")]
    InvalidRemotePayload(String),

    /// Invalid sync configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure is expected to clear up on a later cycle.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::LockTimeout(_))
    }

    /// Whether the failure came from local persistence.
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Database(_) | Self::LibSql(_) | Self::Io(_))
    }
}
