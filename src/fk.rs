// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Foreign-key propagator.
//!
//! A child row must not reach the external system before the parent it
//! references exists there. Instead of failing the child (and burning its
//! retry budget), the propagator *parks* it: the item stays `in_flight` with
//! `parked_on` set, and a row in `sync_queue_dependencies` records the edge.
//!
//! ```text
//! child claimed ──→ parent INSERT pending/in_flight/failed? ──yes──→ park
//!                                    │
//!                                    no (succeeded or never queued)
//!                                    ↓
//!                             send to external API
//!
//! parent succeeded ──→ dependents back to pending (same transaction)
//! parent abandoned ──→ dependents abandoned (alerted)
//! ```

use crate::error::Result;
use crate::item::{RecordKey, SyncQueueItem};
use crate::mapper::TableMapper;
use crate::store::{DependencyReport, ParkOutcome, SyncQueueStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Whether a claimed item may be sent now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FkDecision {
    /// Every referenced parent is replicated.
    Ready,
    /// Parked behind this parent; retry budget untouched.
    Parked(RecordKey),
    /// This parent was abandoned; the item can never apply.
    ParentAbandoned(RecordKey),
    /// The claim was lost while checking.
    Lost,
}

/// Defers items whose parents have not been replicated yet.
#[derive(Debug, Clone)]
pub struct ForeignKeyPropagator {
    store: SyncQueueStore,
    mapper: Arc<TableMapper>,
}

impl ForeignKeyPropagator {
    pub fn new(store: SyncQueueStore, mapper: Arc<TableMapper>) -> Self {
        Self { store, mapper }
    }

    /// Check every parent the item references, parking on the first
    /// unresolved one.
    pub async fn check(&self, item: &SyncQueueItem) -> Result<FkDecision> {
        for parent in self.mapper.parent_refs(item)? {
            match self.store.park(item.sequence, &parent).await? {
                ParkOutcome::Resolved => continue,
                ParkOutcome::Parked => {
                    debug!(sequence = item.sequence, parent = %parent, "Parked behind unsynced parent");
                    crate::metrics::record_parked(&item.table, &parent.table);
                    return Ok(FkDecision::Parked(parent));
                }
                ParkOutcome::ParentAbandoned => return Ok(FkDecision::ParentAbandoned(parent)),
                ParkOutcome::Lost => return Ok(FkDecision::Lost),
            }
        }
        Ok(FkDecision::Ready)
    }

    /// Note dependents released by a parent's success.
    pub fn released(&self, parent_sequence: i64, released: &[i64]) {
        if !released.is_empty() {
            debug!(parent_sequence, count = released.len(), "Released parked dependents");
            crate::metrics::record_released(released.len());
        }
    }

    /// Settle parked items whose parent changed state while no worker was
    /// watching (crash between commit and release, operator edits).
    pub async fn recover(&self) -> Result<DependencyReport> {
        let report = self.store.reconcile_dependencies().await?;
        if !report.released.is_empty() || !report.abandoned.is_empty() {
            info!(
                released = report.released.len(),
                abandoned = report.abandoned.len(),
                "Reconciled parked dependents"
            );
        }
        Ok(report)
    }
}
