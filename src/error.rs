//! Error types for the sync engine

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// A peer sent something that breaks the protocol; the connection goes.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    /// A local invariant does not hold. Never caused by peer input alone.
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Storage error: {0}")]
    Storage(String),
    /// Revert target lies below the oldest retained spent history.
    #[error("History pruned below height {height}")]
    HistoryPruned { height: u32 },
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Script error: {0}")]
    Script(String),
    #[error("Cryptographic error: {0}")]
    Crypto(String),
    #[error("Shutting down")]
    Shutdown,
}

/// How the caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Drop the offending connection, keep running.
    Disconnect,
    /// Stop the affected component.
    Fatal,
    /// Transient; try again on the next wake-up.
    Retryable,
}

impl ChainError {
    pub fn severity(&self) -> Severity {
        match self {
            ChainError::ProtocolViolation(_) => Severity::Disconnect,
            ChainError::Storage(_) | ChainError::IoError(_) => Severity::Retryable,
            ChainError::HistoryPruned { .. } => Severity::Retryable,
            ChainError::Integrity(_)
            | ChainError::Config(_)
            | ChainError::Script(_)
            | ChainError::Crypto(_)
            | ChainError::Shutdown => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::Storage(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
