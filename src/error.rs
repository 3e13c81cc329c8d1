// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync queue.
//!
//! Errors here describe failures of the queue machinery itself (store,
//! configuration, state machine). Failures of the *external* system are
//! modelled separately by [`ExternalError`](crate::external::ExternalError),
//! because they never propagate to callers: they only drive item status.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Busy/locked only | SQLite errors from the queue store |
//! | `Serialization` | No | Payload could not be (de)serialized |
//! | `Config` | No | Configuration invalid |
//! | `InvalidPayload` | No | Enqueue called with a non-object payload |
//! | `Mapping` | No | No mapper entry for a table |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! An error returned from [`Enqueuer::enqueue`](crate::enqueue::Enqueuer::enqueue)
//! must abort the caller's transaction: losing replication intent silently is
//! worse than failing the write.

use crate::mapper::MappingError;
use thiserror::Error;

/// Result type alias for sync queue operations.
pub type Result<T> = std::result::Result<T, SyncQueueError>;

/// Errors that can occur inside the sync queue.
#[derive(Error, Debug)]
pub enum SyncQueueError {
    /// SQLite error from the queue store.
    ///
    /// Only `SQLITE_BUSY`/`SQLITE_LOCKED` are worth retrying; everything else
    /// indicates a local database problem that needs attention.
    #[error("Queue store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Payload JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Enqueue was called with a payload that is not a JSON object.
    #[error("Invalid payload for {table}/{record_id}: {message}")]
    InvalidPayload {
        table: String,
        record_id: String,
        message: String,
    },

    /// The mapper has no entry for the referenced table.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// A persisted row could not be decoded (unknown status, operation, ...).
    #[error("Corrupt queue row {sequence}: {message}")]
    CorruptRow { sequence: i64, message: String },

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running engine).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncQueueError {
    /// Create an invalid payload error.
    pub fn invalid_payload(
        table: impl Into<String>,
        record_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidPayload {
            table: table.into(),
            record_id: record_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => crate::store::is_sqlite_busy_error(e),
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidPayload { .. } => false,
            Self::Mapping(_) => false,
            Self::CorruptRow { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_row_not_found_not_retryable() {
        let err = SyncQueueError::Store(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Queue store error"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = SyncQueueError::Config("staleness must be positive".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_payload_formatting() {
        let err = SyncQueueError::invalid_payload("listing", "L1", "expected object");
        let msg = err.to_string();
        assert!(msg.contains("listing/L1"));
        assert!(msg.contains("expected object"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_mapping_error_is_transparent() {
        let err: SyncQueueError = MappingError::UnmappedTable("ghost".to_string()).into();
        assert_eq!(err.to_string(), "no mapping for table 'ghost'");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = SyncQueueError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_corrupt_row_formatting() {
        let err = SyncQueueError::CorruptRow {
            sequence: 42,
            message: "unknown status 'bogus'".to_string(),
        };
        assert!(err.to_string().contains("42"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!SyncQueueError::Shutdown.is_retryable());
        assert!(!SyncQueueError::Internal("boom".into()).is_retryable());
    }
}
