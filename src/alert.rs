// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operator alert channel for abandoned items.
//!
//! Abandoned items never retry on their own; somebody has to look at them.
//! Every abandonment that needs a human goes through an [`AlertSink`].

use crate::item::{Operation, RecordKey};
use serde::Serialize;
use std::fmt;
use tracing::error;

/// Why an item was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonKind {
    /// The external system rejected the payload.
    Validation,
    /// No mapper entry for the item's table.
    Mapping,
    /// Transient failures exhausted the retry budget.
    RetriesExhausted,
    /// A referenced parent was abandoned, so this item can never apply.
    ParentAbandoned,
}

impl AbandonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Mapping => "mapping",
            Self::RetriesExhausted => "retries_exhausted",
            Self::ParentAbandoned => "parent_abandoned",
        }
    }
}

impl fmt::Display for AbandonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One abandoned item, as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbandonAlert {
    pub sequence: i64,
    pub record: RecordKey,
    pub operation: Operation,
    pub attempts: u32,
    pub kind: AbandonKind,
    pub reason: String,
}

/// Receives abandonment alerts.
///
/// Called from worker tasks; implementations should hand off quickly
/// (enqueue to a pager, write a row) rather than block.
pub trait AlertSink: Send + Sync + 'static {
    fn abandoned(&self, alert: &AbandonAlert);
}

/// Default sink: logs at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn abandoned(&self, alert: &AbandonAlert) {
        error!(
            sequence = alert.sequence,
            record = %alert.record,
            operation = %alert.operation,
            attempts = alert.attempts,
            kind = %alert.kind,
            reason = %alert.reason,
            "Sync item abandoned, operator action required"
        );
    }
}
