//! Error types for Polymerase
//!
//! This module defines the common error taxonomy used throughout the system.

use crate::types::BackupMeta;
use thiserror::Error;

/// Common result type for Polymerase operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Polymerase
#[derive(Debug, Error)]
pub enum Error {
    // Session errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session aborted: {0}")]
    Aborted(String),

    #[error("invalid request: {0}")]
    Validation(String),

    // Catalog errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no lineage of db {db} ends at lsn {lsn}")]
    LineageNotFound { db: String, lsn: String },

    #[error("backup chain of db {db} is broken at {at}: {reason}")]
    ChainBroken {
        db: String,
        at: String,
        reason: String,
        /// Chain suffix assembled before the break, oldest first
        collected: Vec<BackupMeta>,
    },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("malformed key: {0}")]
    KeyDecode(String),

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock unavailable: {0}")]
    Lock(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol error (message received in an illegal state)
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Create a key decode error
    pub fn key_decode(msg: impl Into<String>) -> Self {
        Self::KeyDecode(msg.into())
    }

    /// Create a metadata store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::LineageNotFound { .. })
    }

    /// Check if the caller may retry the whole operation unchanged
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Lock(_) | Self::Store(_))
    }

    /// Check if the error was caused by the request rather than the server
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::Validation(_)
                | Self::KeyDecode(_)
                | Self::Aborted(_)
                | Self::AlreadyExists(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("db").is_not_found());
        assert!(
            Error::LineageNotFound {
                db: "shop".into(),
                lsn: "500".into()
            }
            .is_not_found()
        );
        assert!(!Error::protocol("x").is_not_found());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::lock("meta-backup-").is_retryable());
        assert!(!Error::validation("empty db").is_retryable());
    }

    #[test]
    fn test_chain_broken_message() {
        let err = Error::ChainBroken {
            db: "shop".into(),
            at: "shop/a/b".into(),
            reason: "to_lsn 10 != from_lsn 20".into(),
            collected: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "backup chain of db shop is broken at shop/a/b: to_lsn 10 != from_lsn 20"
        );
    }
}
