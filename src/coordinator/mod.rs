// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync queue engine coordinator.
//!
//! Ties together:
//! - The queue store via [`crate::store::SyncQueueStore`]
//! - The queue processor (trigger-driven drain) via [`Processor`]
//! - The periodic reconciler (safety-net sweep) via [`Reconciler`]
//! - Crash recovery at start-up
//!
//! # Lifecycle
//!
//! 1. `new()`: handlers can take an [`Enqueuer`] and a [`TriggerDispatcher`]
//!    straight away; wake-ups buffer in the channel until start
//! 2. `start()`: opens the store, returns crashed claims to `pending`,
//!    settles parked items, spawns processor and reconciler, drains once
//! 3. `shutdown()`: lets the current wave finish (bounded), closes the store

mod processor;
mod reconciler;
mod types;

pub use processor::{DrainStats, ProcessOutcome, Processor};
pub use reconciler::{run_reconciler, Reconciler, SweepStats};
pub use types::{EngineState, HealthCheck};

use crate::alert::{AlertSink, LogAlertSink};
use crate::circuit_breaker::{CircuitState, ExternalApiCircuit};
use crate::config::SyncQueueConfig;
use crate::enqueue::Enqueuer;
use crate::error::{Result, SyncQueueError};
use crate::external::{ExternalApi, NoOpExternalApi};
use crate::fk::ForeignKeyPropagator;
use crate::mapper::TableMapper;
use crate::metrics;
use crate::store::SyncQueueStore;
use crate::trigger::{TriggerDispatcher, WakeSignal};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The outbound sync queue engine.
///
/// Owns the background side of the queue. The write side (enqueue inside the
/// request transaction, dispatch after commit) only needs the handles returned
/// by [`enqueuer()`](Self::enqueuer) and [`dispatcher()`](Self::dispatcher).
pub struct SyncQueueEngine<A: ExternalApi = NoOpExternalApi> {
    config: SyncQueueConfig,

    mapper: Arc<TableMapper>,

    /// The legacy system of record.
    api: Arc<A>,

    alerts: Arc<dyn AlertSink>,

    /// `None` when the breaker is disabled in config.
    circuit: Option<Arc<ExternalApiCircuit>>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    dispatcher: TriggerDispatcher,

    /// Taken by the processor task at start.
    wake_rx: Option<mpsc::Receiver<WakeSignal>>,

    /// Opened at start.
    store: Option<SyncQueueStore>,
    processor: Option<Arc<Processor<A>>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    task_handles: Vec<JoinHandle<()>>,
}

impl SyncQueueEngine<NoOpExternalApi> {
    /// Create an engine that accepts every write without sending it anywhere.
    ///
    /// Useful for development and for exercising the write path alone.
    pub fn new(config: SyncQueueConfig, mapper: TableMapper) -> Self {
        Self::with_external_api(config, mapper, Arc::new(NoOpExternalApi))
    }
}

impl<A: ExternalApi> SyncQueueEngine<A> {
    /// Create an engine that replicates to `api`.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to begin processing.
    pub fn with_external_api(config: SyncQueueConfig, mapper: TableMapper, api: Arc<A>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (wake_tx, wake_rx) =
            mpsc::channel(config.settings.processor.wake_channel_capacity.max(1));

        let circuit = config
            .settings
            .processor
            .circuit_config()
            .map(|cfg| Arc::new(ExternalApiCircuit::with_config(cfg)));

        Self {
            config,
            mapper: Arc::new(mapper),
            api,
            alerts: Arc::new(LogAlertSink),
            circuit,
            state_tx,
            state_rx,
            dispatcher: TriggerDispatcher::new(wake_tx),
            wake_rx: Some(wake_rx),
            store: None,
            processor: None,
            shutdown_tx,
            shutdown_rx,
            task_handles: Vec::new(),
        }
    }

    /// Route abandonment alerts to `sink` instead of the log.
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    pub fn config(&self) -> &SyncQueueConfig {
        &self.config
    }

    pub fn mapper(&self) -> &Arc<TableMapper> {
        &self.mapper
    }

    /// Handle for request handlers to append items inside their transaction.
    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer::new(Arc::clone(&self.mapper))
    }

    /// Handle for request handlers to wake the processor after commit.
    pub fn dispatcher(&self) -> TriggerDispatcher {
        self.dispatcher.clone()
    }

    /// The queue store, once started.
    pub fn store(&self) -> Option<&SyncQueueStore> {
        self.store.as_ref()
    }

    /// The processor, once started.
    pub fn processor(&self) -> Option<&Arc<Processor<A>>> {
        self.processor.as_ref()
    }

    pub fn circuit(&self) -> Option<&Arc<ExternalApiCircuit>> {
        self.circuit.as_ref()
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Snapshot for health endpoints. One `COUNT` query, no external calls.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let circuit_state = self.circuit.as_ref().map(|c| c.writes.state());

        let queue = match &self.store {
            Some(store) => match store.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "Failed to read queue stats for health check");
                    None
                }
            },
            None => None,
        };

        HealthCheck {
            state,
            ready: state == EngineState::Running && circuit_state != Some(CircuitState::Open),
            circuit_state,
            queue,
            mapper_version: self.mapper.version,
        }
    }

    /// Start the engine.
    ///
    /// 1. Opens the queue store (SQLite)
    /// 2. Returns items claimed by a crashed worker to `pending`
    /// 3. Settles parked items whose parent changed state while down
    /// 4. Spawns the processor and, if enabled, the reconciler
    /// 5. Triggers an initial drain
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(SyncQueueError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            mapper_version = self.mapper.version,
            tables = self.mapper.tables.len(),
            path = %self.config.store.sqlite_path,
            "Starting sync queue engine"
        );
        self.set_state(EngineState::Starting);

        let processor = match self.open_and_recover().await {
            Ok(processor) => processor,
            Err(e) => {
                error!(error = %e, "Sync queue engine failed to start");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let Some(wake_rx) = self.wake_rx.take() else {
            self.set_state(EngineState::Failed);
            return Err(SyncQueueError::Internal("wake-up receiver already taken".to_string()));
        };

        let shutdown_rx = self.shutdown_rx.clone();
        let runner = Arc::clone(&processor);
        self.task_handles
            .push(tokio::spawn(async move { runner.run(wake_rx, shutdown_rx).await }));
        debug!("Spawned queue processor");

        if self.config.settings.reconciler.enabled {
            if let Some(store) = &self.store {
                let reconciler = Reconciler::new(
                    store.clone(),
                    self.dispatcher.clone(),
                    self.config.settings.reconciler.clone(),
                );
                let shutdown_rx = self.shutdown_rx.clone();
                self.task_handles
                    .push(tokio::spawn(run_reconciler(reconciler, shutdown_rx)));
                debug!("Spawned reconciler");
            }
        }

        self.processor = Some(processor);
        self.set_state(EngineState::Running);

        // Anything committed while we were down
        self.dispatcher.dispatch();

        info!("Sync queue engine running");
        Ok(())
    }

    async fn open_and_recover(&mut self) -> Result<Arc<Processor<A>>> {
        let store = SyncQueueStore::open_with(&self.config.store).await?;
        info!(path = %self.config.store.sqlite_path, "Queue store opened");

        let processor = Arc::new(Processor::new(
            store.clone(),
            Arc::clone(&self.mapper),
            Arc::clone(&self.api),
            Arc::clone(&self.alerts),
            self.dispatcher.clone(),
            self.circuit.clone(),
            &self.config.settings,
        ));

        let requeued = store.recover_in_flight().await?;
        let report = ForeignKeyPropagator::new(store.clone(), Arc::clone(&self.mapper))
            .recover()
            .await?;
        processor.alert_cascaded(&report.abandoned).await;
        metrics::record_recovery(requeued, report.released.len(), report.abandoned.len());

        if requeued > 0 {
            warn!(requeued, "Recovered items claimed before an unclean shutdown");
        }

        if let Ok(stats) = store.stats().await {
            metrics::set_queue_depth(&stats);
            info!(
                pending = stats.pending,
                failed = stats.failed,
                parked = stats.parked,
                abandoned = stats.abandoned,
                "Queue state at start-up"
            );
        }

        self.store = Some(store);
        Ok(processor)
    }

    /// Run one reconciler sweep now, outside the schedule.
    pub async fn reconcile_now(&self) -> Result<SweepStats> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| SyncQueueError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            })?;
        Reconciler::new(
            store.clone(),
            self.dispatcher.clone(),
            self.config.settings.reconciler.clone(),
        )
        .sweep()
        .await
    }

    /// Shut the engine down gracefully.
    ///
    /// 1. Signal processor and reconciler to stop
    /// 2. Wait for the current wave to finish (bounded by `drain_timeout`)
    /// 3. Checkpoint and close the store
    ///
    /// Items still `in_flight` after a timed-out drain are returned to
    /// `pending` on the next start.
    pub async fn shutdown(&mut self) {
        info!("Shutting down sync queue engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.task_handles);
        let drain_timeout = self.config.settings.processor.drain_timeout_duration();
        if !handles.is_empty() {
            info!(task_count = handles.len(), "Waiting for tasks to drain and complete");
        }

        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(processor) = self.processor.take() {
            processor.cancel_timers().await;
        }

        if let Some(store) = self.store.take() {
            store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Sync queue engine stopped");
    }
}
