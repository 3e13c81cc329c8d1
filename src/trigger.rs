// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Trigger dispatcher: post-commit wake-ups for the queue processor.
//!
//! Three producers feed one consumer over a bounded channel:
//!
//! ```text
//! request handler ──dispatch()──┐
//! backoff timers ───RetryDue────┼──→ mpsc ──→ Processor::run
//! reconciler ───Reconcile(seqs)─┘
//! ```
//!
//! Wake-ups are at-least-once and idempotent: a redundant signal costs one
//! empty drain. A full channel already holds a pending wake-up, so dropping
//! the new one loses nothing.

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Why the processor is being woken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeSignal {
    /// New items were committed.
    Trigger,
    /// A backoff delay elapsed.
    RetryDue,
    /// The reconciler found these stale items.
    Reconcile(Vec<i64>),
}

/// Fire-and-forget wake-up handle given to request handlers.
#[derive(Debug, Clone)]
pub struct TriggerDispatcher {
    tx: mpsc::Sender<WakeSignal>,
}

impl TriggerDispatcher {
    pub fn new(tx: mpsc::Sender<WakeSignal>) -> Self {
        Self { tx }
    }

    /// Wake the processor. Never blocks, never fails the caller.
    pub fn dispatch(&self) {
        self.send(WakeSignal::Trigger);
    }

    pub(crate) fn send(&self, signal: WakeSignal) {
        match self.tx.try_send(signal) {
            Ok(()) => crate::metrics::record_dispatch("sent"),
            Err(mpsc::error::TrySendError::Full(signal)) => {
                debug!(?signal, "Wake-up already pending, coalesced");
                crate::metrics::record_dispatch("coalesced");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Sync queue processor is not running, wake-up dropped");
                crate::metrics::record_dispatch("closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
