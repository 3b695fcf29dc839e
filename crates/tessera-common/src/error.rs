//! Error types for Tessera
//!
//! This module defines the common error types used throughout the engine.

use thiserror::Error;

/// Common result type for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Tessera
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("invalid relative path: {0}")]
    InvalidPath(String),

    #[error("data corruption detected: {0}")]
    Corruption(String),

    #[error("journal replay failed for transaction {txn}: {reason}")]
    JournalReplay { txn: String, reason: String },

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("data directory is locked by another engine: {0}")]
    DataDirLocked(String),

    // Partition errors
    #[error("partition does not exist: {0}")]
    PartitionNotFound(String),

    #[error("partition already exists: {0}")]
    PartitionAlreadyExists(String),

    // Record errors
    #[error("{kind} does not exist: {key}")]
    RecordNotFound { kind: &'static str, key: String },

    // Session contract violations
    #[error("transaction {0} is already committed or rolled back")]
    TransactionTerminated(String),

    #[error("session is read only")]
    ReadOnlySession,

    #[error("lock not held: {0}")]
    LockNotHeld(String),

    #[error("session is closed")]
    SessionClosed,

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a journal replay error for a transaction
    pub fn replay(txn: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::JournalReplay {
            txn: txn.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::PartitionNotFound(_) | Self::RecordNotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error means on-disk state can no longer be trusted.
    ///
    /// Nothing above the engine can repair these, so callers are expected to
    /// stop serving the affected data directory.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corruption(_) | Self::JournalReplay { .. } | Self::RecoveryFailed(_)
        )
    }

    /// Check if this error is a misuse of the session or transaction API
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::TransactionTerminated(_)
                | Self::ReadOnlySession
                | Self::LockNotHeld(_)
                | Self::SessionClosed
                | Self::InvalidPath(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::PartitionNotFound("p".into()).is_not_found());
        assert!(
            Error::RecordNotFound {
                kind: "struct",
                key: "k".into()
            }
            .is_not_found()
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::from(io).is_not_found());
        assert!(!Error::ReadOnlySession.is_not_found());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::replay("tx", "boom").is_fatal());
        assert!(Error::RecoveryFailed("x".into()).is_fatal());
        assert!(!Error::PartitionAlreadyExists("p".into()).is_fatal());
    }

    #[test]
    fn test_error_contract_violation() {
        assert!(Error::TransactionTerminated("tx".into()).is_contract_violation());
        assert!(Error::ReadOnlySession.is_contract_violation());
        assert!(!Error::Internal("x".into()).is_contract_violation());
    }

    #[test]
    fn test_error_display() {
        let e = Error::RecordNotFound {
            kind: "contract",
            key: "transfer".into(),
        };
        assert_eq!(e.to_string(), "contract does not exist: transfer");
    }
}
