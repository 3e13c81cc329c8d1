//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Enqueue and trigger traffic
//! - Per-item outcomes and external API latency
//! - FK parking and release
//! - Retry scheduling and abandonment
//! - Reconciler sweeps
//! - Queue depth per status
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `sync_queue_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate never installs a recorder; the host application picks the
//! exporter.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sync_queue::metrics;
//! use std::time::Duration;
//!
//! metrics::record_enqueued("listing", "INSERT");
//! metrics::record_drain_cycle(12, Duration::from_millis(80));
//! ```

use crate::circuit_breaker::CircuitState;
use crate::store::QueueStats;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Write path
// =============================================================================

/// Record an item appended by the enqueuer.
pub fn record_enqueued(table: &str, operation: &str) {
    counter!(
        "sync_queue_enqueued_total",
        "table" => table.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a trigger dispatch (`sent`, `coalesced`, `closed`).
pub fn record_dispatch(outcome: &'static str) {
    counter!("sync_queue_dispatch_total", "outcome" => outcome).increment(1);
}

// =============================================================================
// Processing
// =============================================================================

/// Record the outcome of processing one item.
pub fn record_item_outcome(table: &str, outcome: &'static str) {
    counter!(
        "sync_queue_items_processed_total",
        "table" => table.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record latency of one external API call.
pub fn record_external_latency(entity: &str, operation: &str, duration: Duration) {
    histogram!(
        "sync_queue_external_call_duration_seconds",
        "entity" => entity.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry scheduled after a transient failure.
pub fn record_retry_scheduled(table: &str, attempt: u32) {
    counter!("sync_queue_retries_scheduled_total", "table" => table.to_string()).increment(1);
    histogram!("sync_queue_retry_attempt").record(f64::from(attempt));
}

/// Record an abandoned item, by cause.
pub fn record_abandoned(table: &str, kind: &'static str) {
    counter!(
        "sync_queue_abandoned_total",
        "table" => table.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record one drain cycle (all waves triggered by a wake-up).
pub fn record_drain_cycle(processed: usize, duration: Duration) {
    counter!("sync_queue_drain_cycles_total").increment(1);
    histogram!("sync_queue_drain_cycle_items").record(processed as f64);
    histogram!("sync_queue_drain_cycle_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// FK deferral
// =============================================================================

/// Record an item parked behind an unsynced parent.
pub fn record_parked(table: &str, parent_table: &str) {
    counter!(
        "sync_queue_parked_total",
        "table" => table.to_string(),
        "parent_table" => parent_table.to_string()
    )
    .increment(1);
}

/// Record dependents released after their parent succeeded.
pub fn record_released(count: usize) {
    if count > 0 {
        counter!("sync_queue_released_total").increment(count as u64);
    }
}

// =============================================================================
// Reconciler / recovery
// =============================================================================

/// Record a reconciler sweep.
pub fn record_reconcile_sweep(stale_found: usize, duration: Duration) {
    counter!("sync_queue_reconcile_sweeps_total").increment(1);
    counter!("sync_queue_reconcile_resignalled_total").increment(stale_found as u64);
    histogram!("sync_queue_reconcile_duration_seconds").record(duration.as_secs_f64());
}

/// Record a skipped reconciler sweep (`shutdown`, `error`).
pub fn record_reconcile_skipped(reason: &'static str) {
    counter!("sync_queue_reconcile_skipped_total", "reason" => reason).increment(1);
}

/// Record start-up crash recovery.
pub fn record_recovery(requeued: u64, released: usize, abandoned: usize) {
    counter!("sync_queue_recovered_in_flight_total").increment(requeued);
    counter!("sync_queue_recovered_released_total").increment(released as u64);
    counter!("sync_queue_recovered_abandoned_total").increment(abandoned as u64);
}

/// Record a queue row that could not be decoded.
pub fn record_corrupt_row() {
    counter!("sync_queue_corrupt_rows_total").increment(1);
}

/// Set the number of pending items whose payload cannot be decoded.
pub fn set_unreadable_items(count: u64) {
    gauge!("sync_queue_unreadable_items").set(count as f64);
}

/// Record a store operation retried on SQLITE_BUSY/LOCKED.
pub fn record_store_retry(operation: &str) {
    counter!("sync_queue_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Gauges
// =============================================================================

/// Set queue depth gauges from a stats snapshot.
pub fn set_queue_depth(stats: &QueueStats) {
    gauge!("sync_queue_items", "status" => "pending").set(stats.pending as f64);
    gauge!("sync_queue_items", "status" => "in_flight").set(stats.in_flight as f64);
    gauge!("sync_queue_items", "status" => "succeeded").set(stats.succeeded as f64);
    gauge!("sync_queue_items", "status" => "failed").set(stats.failed as f64);
    gauge!("sync_queue_items", "status" => "abandoned").set(stats.abandoned as f64);
    gauge!("sync_queue_parked_items").set(stats.parked as f64);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("sync_queue_engine_state").set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &'static str) {
    counter!(
        "sync_queue_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: CircuitState) {
    gauge!("sync_queue_circuit_state", "circuit" => circuit_name.to_string()).set(state as u8 as f64);
}
