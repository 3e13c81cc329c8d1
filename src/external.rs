// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External write API seam.
//!
//! The legacy system of record is reached through [`ExternalApi`]. The
//! processor never sees transport details, only the two-way classification
//! that drives item status:
//!
//! | Error | Item outcome |
//! |-------|--------------|
//! | [`ExternalError::Transient`] | `failed`, retried with backoff until `max_attempts` |
//! | [`ExternalError::Validation`] | `abandoned` immediately, operator alerted |
//!
//! Implementations must tolerate duplicate delivery: a crash after the
//! external call but before `succeeded` is recorded replays the write with the
//! same [`idempotency_key`](crate::mapper::ExternalWrite::idempotency_key).
//!
//! # Example
//!
//! ```rust,no_run
//! use sync_queue::external::{BoxFuture, ExternalApi, ExternalError};
//! use sync_queue::mapper::ExternalWrite;
//!
//! struct LegacyClient;
//!
//! impl ExternalApi for LegacyClient {
//!     fn write(&self, write: ExternalWrite) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             if write.fields.is_empty() && write.operation != sync_queue::Operation::Delete {
//!                 return Err(ExternalError::Validation("empty write".into()));
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::mapper::ExternalWrite;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Result type for external API calls.
pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ExternalResult<T>> + Send + 'a>>;

/// Failure of one external write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    /// Network error, timeout, throttling, 5xx. Worth retrying.
    #[error("transient external error: {0}")]
    Transient(String),

    /// The external system rejected the payload. Retrying cannot help.
    #[error("external validation error: {0}")]
    Validation(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-2xx HTTP status.
    ///
    /// 408, 425, 429 and every 5xx are transient; any other status means the
    /// external system looked at the request and refused it.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = format!("HTTP {}: {}", status, body.into());
        match status {
            408 | 425 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Validation(message),
        }
    }

    /// The call did not complete within the request timeout.
    pub fn timeout(after: Duration) -> Self {
        Self::Transient(format!("timed out after {}", humantime::format_duration(after)))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Validation(m) => m,
        }
    }
}

/// Trait defining what we need from the external system of record.
///
/// One call per translated write. The host application provides the
/// implementation; [`HttpExternalApi`](crate::http::HttpExternalApi) covers
/// REST-shaped legacy systems.
pub trait ExternalApi: Send + Sync + 'static {
    /// Apply one create/update/delete to the external system.
    fn write(&self, write: ExternalWrite) -> BoxFuture<'_, ()>;
}

impl<T: ExternalApi + ?Sized> ExternalApi for std::sync::Arc<T> {
    fn write(&self, write: ExternalWrite) -> BoxFuture<'_, ()> {
        (**self).write(write)
    }
}

/// Accepts every write without sending it anywhere.
///
/// Useful for running the queue in environments with no legacy system
/// (local development, tests of the write path).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpExternalApi;

impl ExternalApi for NoOpExternalApi {
    fn write(&self, write: ExternalWrite) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::trace!(entity = %write.entity, id = %write.external_id, "No-op external write");
            Ok(())
        })
    }
}
