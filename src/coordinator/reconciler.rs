// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic reconciler: the safety net under the trigger path.
//!
//! A post-commit trigger can be lost (process crash between commit and
//! dispatch, a full channel at the wrong moment, a processor restart). On a
//! fixed interval, independent of triggers, the reconciler looks for items
//! that should be moving but are not:
//!
//! - `pending` with no transition for longer than the staleness threshold
//! - `failed` with no transition for that long *and* a backoff deadline that
//!   has passed
//!
//! and re-signals the processor for exactly those sequences. `abandoned`
//! items are never swept; they wait for an operator.

use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::metrics;
use crate::store::{now_millis, SyncQueueStore};
use crate::trigger::{TriggerDispatcher, WakeSignal};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Floor for the sweep interval; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// Sequences found stale and re-signalled.
    pub stale: Vec<i64>,
    /// The sweep hit `max_items_per_sweep`; more may be waiting.
    pub truncated: bool,
    /// Pending items with an unreadable payload; each stalls its record.
    pub unreadable: u64,
}

/// Finds stuck items and wakes the processor for them.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: SyncQueueStore,
    dispatcher: TriggerDispatcher,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: SyncQueueStore, dispatcher: TriggerDispatcher, config: ReconcilerConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Sweep as of now.
    pub async fn sweep(&self) -> Result<SweepStats> {
        self.sweep_at(now_millis()).await
    }

    /// Sweep as of `now_ms` (epoch millis).
    #[instrument(skip(self), fields(max_items = self.config.max_items_per_sweep))]
    pub async fn sweep_at(&self, now_ms: i64) -> Result<SweepStats> {
        let started = Instant::now();
        let staleness = self.config.staleness_duration().as_millis() as i64;
        let cutoff = now_ms.saturating_sub(staleness);
        let limit = self.config.max_items_per_sweep.max(1);

        let stale = self.store.find_stale(cutoff, now_ms, limit).await?;
        let unreadable = self.store.count_unreadable().await?;
        let stats = SweepStats {
            truncated: stale.len() >= limit,
            stale,
            unreadable,
        };
        metrics::set_unreadable_items(unreadable);
        if unreadable > 0 {
            error!(unreadable, "Queue holds unreadable items; their records are stalled");
        }

        if !stats.stale.is_empty() {
            if self.dispatcher.is_closed() {
                metrics::record_reconcile_skipped("processor_stopped");
            } else {
                self.dispatcher.send(WakeSignal::Reconcile(stats.stale.clone()));
            }
        }

        let duration = started.elapsed();
        metrics::record_reconcile_sweep(stats.stale.len(), duration);

        if stats.stale.is_empty() {
            debug!("Reconcile sweep found nothing stale");
        } else {
            info!(
                stale = stats.stale.len(),
                truncated = stats.truncated,
                duration_ms = duration.as_millis() as u64,
                "Reconcile sweep re-signalled stale items"
            );
        }

        Ok(stats)
    }
}

/// Run the reconciler until shutdown is signalled.
///
/// The first sweep happens one full interval after start; engine start-up
/// already drains whatever is pending.
pub async fn run_reconciler(reconciler: Reconciler, mut shutdown_rx: watch::Receiver<bool>) {
    let span = tracing::info_span!("sync_queue_reconciler");

    async move {
        let _ = shutdown_rx.borrow_and_update();

        let interval = reconciler.config().interval_duration().max(MIN_INTERVAL);
        info!(
            interval_ms = interval.as_millis() as u64,
            staleness_ms = reconciler.config().staleness_duration().as_millis() as u64,
            "Starting reconciler"
        );

        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconciler");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            if let Err(e) = reconciler.sweep().await {
                warn!(error = %e, retryable = e.is_retryable(), "Reconcile sweep failed");
            }
        }

        info!("Reconciler stopped");
    }
    .instrument(span)
    .await
}
