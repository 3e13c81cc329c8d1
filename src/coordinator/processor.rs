//! Queue processor: drains ready items to the external system.
//!
//! One long-lived task consumes [`WakeSignal`]s. Every wake-up runs a drain:
//!
//! 1. Promote `failed` items whose backoff elapsed back to `pending`
//! 2. Select the current head of every record (`next_ready`)
//! 3. Claim each head (CAS) and process it under the bulkhead
//! 4. Wait for the wave, then select again until nothing is ready
//!
//! Items for one record are never in the same wave, so the external system
//! sees each record's operations in `sequence` order. Different records run
//! concurrently, bounded by `max_workers`.
//!
//! # Per-item state machine
//!
//! ```text
//! pending ──claim──→ in_flight ──ok──────────────→ succeeded
//!                       │  │
//!                       │  └──transient──→ failed ──backoff──→ pending
//!                       │                    │
//!                       │        attempts == max
//!                       ↓                    ↓
//!                 (parked on parent)     abandoned ←── validation / mapping
//! ```
//!
//! # Circuit Breaker
//!
//! When the breaker rejects a call the claim is released without spending an
//! attempt, and draining pauses for the breaker's recovery timeout. A timer
//! wakes the processor when the pause ends.

use crate::alert::{AbandonAlert, AbandonKind, AlertSink};
use crate::circuit_breaker::{CircuitError, ExternalApiCircuit};
use crate::config::SyncSettings;
use crate::error::Result;
use crate::external::{ExternalApi, ExternalError};
use crate::fk::{FkDecision, ForeignKeyPropagator};
use crate::item::SyncQueueItem;
use crate::mapper::{ExternalWrite, TableMapper};
use crate::metrics;
use crate::resilience::{Bulkhead, RateLimiter, RetryPolicy};
use crate::store::{now_millis, SyncQueueStore};
use crate::trigger::{TriggerDispatcher, WakeSignal};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Reason recorded on items that follow a replicated DELETE of their record.
const RECORD_DELETED: &str = "record deleted";

/// What happened to one claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The external system applied the write.
    Succeeded,
    /// Transient failure; the item becomes `pending` again after `retry_in`.
    Failed { retry_in: Duration },
    /// Moved to `abandoned`.
    Abandoned,
    /// Waiting for a parent record to replicate.
    Parked,
    /// Another worker owns the item, or it is no longer `in_flight`.
    Skipped,
    /// Circuit open; the claim was released with attempts unchanged.
    Deferred,
}

impl ProcessOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Abandoned => "abandoned",
            Self::Parked => "parked",
            Self::Skipped => "skipped",
            Self::Deferred => "deferred",
        }
    }
}

/// Totals for one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub waves: usize,
    pub promoted: u64,
    pub requeued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub parked: usize,
    pub skipped: usize,
    pub deferred: usize,
    /// Items whose processing hit a store error and were handed back.
    pub errors: usize,
    /// Draining stopped early because the circuit is open.
    pub paused: bool,
}

impl DrainStats {
    /// Items that reached a new state during this drain.
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.abandoned + self.parked
    }

    fn record(&mut self, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Succeeded => self.succeeded += 1,
            ProcessOutcome::Failed { .. } => self.failed += 1,
            ProcessOutcome::Abandoned => self.abandoned += 1,
            ProcessOutcome::Parked => self.parked += 1,
            ProcessOutcome::Skipped => self.skipped += 1,
            ProcessOutcome::Deferred => self.deferred += 1,
        }
    }
}

/// Why an external call did not apply.
enum CallError {
    Validation(ExternalError),
    Transient(ExternalError),
    CircuitOpen,
}

/// Consumes wake-ups and pushes ready items to the external API.
pub struct Processor<A: ExternalApi> {
    store: SyncQueueStore,
    mapper: Arc<TableMapper>,
    fk: ForeignKeyPropagator,
    api: Arc<A>,
    alerts: Arc<dyn AlertSink>,
    dispatcher: TriggerDispatcher,
    policy: RetryPolicy,
    circuit: Option<Arc<ExternalApiCircuit>>,
    rate_limiter: Option<RateLimiter>,
    bulkhead: Bulkhead,
    batch_limit: usize,
    /// Backoff and circuit-pause wake-up timers, aborted on shutdown.
    timers: Mutex<JoinSet<()>>,
    paused_until: Mutex<Option<Instant>>,
}

impl<A: ExternalApi> Processor<A> {
    /// Build a processor from the queue settings.
    ///
    /// `dispatcher` must feed the channel later passed to [`run`](Self::run);
    /// backoff timers wake the processor through it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SyncQueueStore,
        mapper: Arc<TableMapper>,
        api: Arc<A>,
        alerts: Arc<dyn AlertSink>,
        dispatcher: TriggerDispatcher,
        circuit: Option<Arc<ExternalApiCircuit>>,
        settings: &SyncSettings,
    ) -> Self {
        let processor = &settings.processor;
        let rate_limiter = processor.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for external writes"
            );
            RateLimiter::new(cfg)
        });

        Self {
            fk: ForeignKeyPropagator::new(store.clone(), Arc::clone(&mapper)),
            store,
            mapper,
            api,
            alerts,
            dispatcher,
            policy: settings.retry.policy(),
            circuit,
            rate_limiter,
            bulkhead: Bulkhead::new(processor.max_workers),
            batch_limit: processor.batch_limit.max(1),
            timers: Mutex::new(JoinSet::new()),
            paused_until: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claim and process one item by sequence.
    ///
    /// An item that is not the `pending` head of its record is left alone and
    /// reported as [`ProcessOutcome::Skipped`]; in particular a `succeeded`
    /// item never reaches the external API again.
    pub async fn process(&self, sequence: i64) -> Result<ProcessOutcome> {
        if !self.store.claim(sequence).await? {
            debug!(sequence, "Claim lost, skipping");
            return Ok(ProcessOutcome::Skipped);
        }
        match self.store.get(sequence).await? {
            Some(item) => self.process_claimed(&item).await,
            None => Ok(ProcessOutcome::Skipped),
        }
    }

    /// Process an item this worker has already claimed (`in_flight`).
    pub async fn process_claimed(&self, item: &SyncQueueItem) -> Result<ProcessOutcome> {
        let outcome = self.dispatch_item(item).await?;
        metrics::record_item_outcome(&item.table, outcome.as_str());
        Ok(outcome)
    }

    async fn dispatch_item(&self, item: &SyncQueueItem) -> Result<ProcessOutcome> {
        let key = item.record_key();

        // A replicated DELETE is terminal for the record.
        if self.store.has_succeeded_delete(&key, item.sequence).await? {
            debug!(sequence = item.sequence, record = %key, "Record already deleted externally");
            let abandonment = self.store.mark_abandoned(item.sequence, RECORD_DELETED, item.attempts).await?;
            if !abandonment.transitioned {
                return Ok(ProcessOutcome::Skipped);
            }
            self.alert_cascaded(&abandonment.cascaded).await;
            return Ok(ProcessOutcome::Abandoned);
        }

        let write = match self.mapper.translate(item) {
            Ok(write) => write,
            Err(e) => {
                return self
                    .abandon(item, AbandonKind::Mapping, e.to_string(), item.attempts)
                    .await
            }
        };

        match self.fk.check(item).await? {
            FkDecision::Ready => {}
            FkDecision::Parked(_) => return Ok(ProcessOutcome::Parked),
            FkDecision::ParentAbandoned(parent) => {
                let reason = format!("parent abandoned: {}", parent);
                return self
                    .abandon(item, AbandonKind::ParentAbandoned, reason, item.attempts)
                    .await;
            }
            FkDecision::Lost => return Ok(ProcessOutcome::Skipped),
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let entity = write.entity.clone();
        let started = Instant::now();
        let result = self.call_external(write).await;
        metrics::record_external_latency(&entity, item.operation.as_str(), started.elapsed());

        match result {
            Ok(()) => self.succeed(item).await,
            Err(CallError::Validation(e)) => {
                self.abandon(item, AbandonKind::Validation, e.message().to_string(), item.attempts + 1)
                    .await
            }
            Err(CallError::Transient(e)) => self.fail(item, &e).await,
            Err(CallError::CircuitOpen) => {
                self.pause_for_circuit().await;
                if self.store.release_claim(item.sequence).await? {
                    debug!(sequence = item.sequence, "Circuit open, claim released");
                    Ok(ProcessOutcome::Deferred)
                } else {
                    Ok(ProcessOutcome::Skipped)
                }
            }
        }
    }

    /// One external call under the request timeout and, if enabled, the
    /// circuit breaker. Validation errors pass through as `Ok(Err(_))` so they
    /// do not count against the breaker.
    async fn call_external(&self, write: ExternalWrite) -> std::result::Result<(), CallError> {
        let timeout = self.policy.request_timeout;
        let api = &self.api;
        let send = || async move {
            match tokio::time::timeout(timeout, api.write(write)).await {
                Ok(Ok(())) => Ok(Ok(())),
                Ok(Err(e @ ExternalError::Validation(_))) => Ok(Err(e)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ExternalError::timeout(timeout)),
            }
        };

        let outcome = match &self.circuit {
            Some(circuit) => circuit.writes.call(send).await,
            None => send().await.map_err(CircuitError::Inner),
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(validation)) => Err(CallError::Validation(validation)),
            Err(CircuitError::Rejected) => Err(CallError::CircuitOpen),
            Err(CircuitError::Inner(transient)) => Err(CallError::Transient(transient)),
        }
    }

    async fn succeed(&self, item: &SyncQueueItem) -> Result<ProcessOutcome> {
        match self.store.mark_succeeded(item.sequence).await? {
            Some(released) => {
                debug!(
                    sequence = item.sequence,
                    table = %item.table,
                    record_id = %item.record_id,
                    operation = %item.operation,
                    "Item replicated"
                );
                self.fk.released(item.sequence, &released);
                Ok(ProcessOutcome::Succeeded)
            }
            None => Ok(ProcessOutcome::Skipped),
        }
    }

    async fn fail(&self, item: &SyncQueueItem, error: &ExternalError) -> Result<ProcessOutcome> {
        let attempts = item.attempts + 1;
        if self.policy.is_exhausted(attempts) {
            let reason = format!("{} (gave up after {} attempts)", error.message(), attempts);
            return self
                .abandon(item, AbandonKind::RetriesExhausted, reason, attempts)
                .await;
        }

        let retry_in = self.policy.delay_for_attempt(attempts);
        let next_attempt_at = now_millis().saturating_add(retry_in.as_millis() as i64);
        if !self
            .store
            .mark_failed(item.sequence, error.message(), attempts, next_attempt_at)
            .await?
        {
            return Ok(ProcessOutcome::Skipped);
        }

        warn!(
            sequence = item.sequence,
            table = %item.table,
            record_id = %item.record_id,
            attempts,
            max_attempts = self.policy.max_attempts,
            retry_in_ms = retry_in.as_millis() as u64,
            error = %error.message(),
            "External write failed, retry scheduled"
        );
        metrics::record_retry_scheduled(&item.table, attempts);
        self.wake_after(retry_in).await;

        Ok(ProcessOutcome::Failed { retry_in })
    }

    async fn abandon(
        &self,
        item: &SyncQueueItem,
        kind: AbandonKind,
        reason: String,
        attempts: u32,
    ) -> Result<ProcessOutcome> {
        let abandonment = self.store.mark_abandoned(item.sequence, &reason, attempts).await?;
        if !abandonment.transitioned {
            return Ok(ProcessOutcome::Skipped);
        }

        metrics::record_abandoned(&item.table, kind.as_str());
        self.alerts.abandoned(&AbandonAlert {
            sequence: item.sequence,
            record: item.record_key(),
            operation: item.operation,
            attempts,
            kind,
            reason,
        });
        self.alert_cascaded(&abandonment.cascaded).await;

        Ok(ProcessOutcome::Abandoned)
    }

    /// Alert for dependents abandoned along with their parent.
    pub(crate) async fn alert_cascaded(&self, sequences: &[i64]) {
        for &sequence in sequences {
            let item = match self.store.get(sequence).await {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    warn!(sequence, error = %e, "Failed to load cascaded abandonment for alerting");
                    continue;
                }
            };
            metrics::record_abandoned(&item.table, AbandonKind::ParentAbandoned.as_str());
            self.alerts.abandoned(&AbandonAlert {
                sequence,
                record: item.record_key(),
                operation: item.operation,
                attempts: item.attempts,
                kind: AbandonKind::ParentAbandoned,
                reason: item.last_error.unwrap_or_default(),
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────────

    async fn wake_after(&self, delay: Duration) {
        let dispatcher = self.dispatcher.clone();
        let mut timers = self.timers.lock().await;
        while timers.try_join_next().is_some() {}
        timers.spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.send(WakeSignal::RetryDue);
        });
    }

    async fn pause_for_circuit(&self) {
        let Some(circuit) = &self.circuit else { return };
        let wait = circuit.writes.recovery_timeout();
        let mut paused = self.paused_until.lock().await;
        if paused.is_some_and(|until| until > Instant::now()) {
            return;
        }
        warn!(wait_ms = wait.as_millis() as u64, "External API circuit open, pausing drain");
        *paused = Some(Instant::now() + wait);
        drop(paused);
        self.wake_after(wait).await;
    }

    /// Hand an abandoned claim back to `pending` so the record is not frozen.
    async fn release_stranded(&self, sequence: i64) {
        if let Err(e) = self.store.release_claim(sequence).await {
            error!(sequence, error = %e, "Failed to release claim");
        }
    }

    async fn pause_remaining(&self) -> Option<Duration> {
        let mut paused = self.paused_until.lock().await;
        match *paused {
            Some(until) => {
                let now = Instant::now();
                if until > now {
                    Some(until - now)
                } else {
                    *paused = None;
                    None
                }
            }
            None => None,
        }
    }

    /// Abort pending backoff timers. Items stay `failed` and are promoted by
    /// the next drain or the reconciler.
    pub async fn cancel_timers(&self) {
        let mut timers = self.timers.lock().await;
        let pending = timers.len();
        timers.abort_all();
        while timers.join_next().await.is_some() {}
        if pending > 0 {
            debug!(pending, "Cancelled backoff timers");
        }
    }
}

impl<A: ExternalApi> Processor<A> {
    /// Drain every ready item, wave by wave.
    ///
    /// Stops when nothing is ready, when the circuit opens, or when shutdown
    /// is signalled (checked between waves; the running wave completes).
    #[tracing::instrument(skip_all)]
    pub async fn drain_ready(self: &Arc<Self>, shutdown_rx: &watch::Receiver<bool>) -> Result<DrainStats> {
        let started = Instant::now();
        let mut stats = DrainStats {
            promoted: self.store.promote_due_retries().await?,
            ..DrainStats::default()
        };

        loop {
            if *shutdown_rx.borrow() {
                debug!("Shutdown requested, ending drain");
                break;
            }
            if let Some(remaining) = self.pause_remaining().await {
                debug!(remaining_ms = remaining.as_millis() as u64, "Drain paused by open circuit");
                stats.paused = true;
                break;
            }

            let ready = self.store.next_ready(self.batch_limit).await?;
            if ready.is_empty() {
                break;
            }
            stats.waves += 1;

            let mut wave = JoinSet::new();
            let mut claimed = HashSet::new();
            let mut claim_error = None;
            for item in ready {
                let permit = match self.bulkhead.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(error = %e, "Worker pool closed");
                        break;
                    }
                };
                match self.store.claim(item.sequence).await {
                    Ok(true) => {}
                    Ok(false) => {
                        stats.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        // Items already spawned must finish before we bail.
                        claim_error = Some(e);
                        break;
                    }
                }

                claimed.insert(item.sequence);
                let processor = Arc::clone(self);
                wave.spawn(async move {
                    let _permit = permit;
                    let outcome = processor.process_claimed(&item).await;
                    (item.sequence, outcome)
                });
            }

            let spawned = wave.len();
            let errors_before = stats.errors;
            while let Some(joined) = wave.join_next().await {
                match joined {
                    Ok((sequence, Ok(outcome))) => {
                        claimed.remove(&sequence);
                        stats.record(outcome);
                    }
                    Ok((sequence, Err(e))) => {
                        claimed.remove(&sequence);
                        stats.errors += 1;
                        warn!(
                            sequence,
                            error = %e,
                            retryable = e.is_retryable(),
                            "Item processing failed, releasing claim"
                        );
                        self.release_stranded(sequence).await;
                    }
                    Err(e) => {
                        stats.errors += 1;
                        error!(error = %e, "Worker task panicked");
                    }
                }
            }

            // Whatever is still claimed belonged to a worker that panicked.
            for sequence in claimed {
                warn!(sequence, "Releasing claim of panicked worker");
                self.release_stranded(sequence).await;
            }

            if let Some(e) = claim_error {
                error!(error = %e, "Claim failed, ending drain");
                return Err(e);
            }
            // Released items wait for the next wake-up rather than spin here.
            if spawned == 0 || stats.errors > errors_before {
                break;
            }
        }

        let elapsed = started.elapsed();
        metrics::record_drain_cycle(stats.processed(), elapsed);
        match self.store.stats().await {
            Ok(queue) => metrics::set_queue_depth(&queue),
            Err(e) => debug!(error = %e, "Failed to refresh queue depth"),
        }

        if stats.processed() > 0 || stats.deferred > 0 {
            debug!(
                waves = stats.waves,
                succeeded = stats.succeeded,
                failed = stats.failed,
                abandoned = stats.abandoned,
                parked = stats.parked,
                deferred = stats.deferred,
                duration_ms = elapsed.as_millis() as u64,
                "Drain complete"
            );
        }

        Ok(stats)
    }

    /// Act on one wake-up: requeue reconciled items, then drain.
    pub async fn handle_signal(
        self: &Arc<Self>,
        signal: WakeSignal,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<DrainStats> {
        self.handle_signals(vec![signal], shutdown_rx).await
    }

    async fn handle_signals(
        self: &Arc<Self>,
        signals: Vec<WakeSignal>,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<DrainStats> {
        let mut requeued = 0;
        for signal in signals {
            if let WakeSignal::Reconcile(sequences) = signal {
                for sequence in sequences {
                    if self.store.requeue_failed(sequence).await? {
                        requeued += 1;
                    }
                }
            }
        }
        if requeued > 0 {
            debug!(requeued, "Requeued stale failed items");
        }

        let mut stats = self.drain_ready(shutdown_rx).await?;
        stats.requeued = requeued;
        Ok(stats)
    }

    /// Run until shutdown is signalled or every wake-up sender is gone.
    ///
    /// Buffered wake-ups are coalesced into a single drain.
    pub async fn run(
        self: Arc<Self>,
        mut wake_rx: mpsc::Receiver<WakeSignal>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let span = info_span!("sync_queue_processor");

        async move {
            info!(
                max_workers = self.bulkhead.max_concurrent(),
                max_attempts = self.policy.max_attempts,
                circuit = self.circuit.is_some(),
                "Starting queue processor"
            );

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping processor");
                            break;
                        }
                    }

                    signal = wake_rx.recv() => {
                        let Some(signal) = signal else {
                            info!("Wake-up channel closed, stopping processor");
                            break;
                        };
                        let mut signals = vec![signal];
                        while let Ok(more) = wake_rx.try_recv() {
                            signals.push(more);
                        }

                        if let Err(e) = self.handle_signals(signals, &shutdown_rx).await {
                            warn!(error = %e, "Drain failed, waiting for next wake-up");
                        }
                    }
                }
            }

            self.cancel_timers().await;
            info!("Queue processor stopped");
        }
        .instrument(span)
        .await
    }
}
