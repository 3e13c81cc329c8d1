//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A recording mock of the external API
//! - A recording alert sink
//! - Engine and store setup on temporary SQLite files
//! - Polling helpers for background processing

#![allow(dead_code)]

pub mod mock_api;

pub use mock_api::*;

use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_queue::config::{ProcessorConfig, RetrySettings};
use sync_queue::{
    AbandonAlert, AlertSink, Enqueuer, ExternalApiCircuit, ItemStatus, Operation, Processor,
    SyncQueueConfig, SyncQueueEngine, SyncQueueStore, SyncSettings, TableMapper, TableMapping,
    TriggerDispatcher, WakeSignal,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

/// Alert sink that keeps every alert for assertions.
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<AbandonAlert>>,
}

impl RecordingAlertSink {
    pub fn alerts(&self) -> Vec<AbandonAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn abandoned(&self, alert: &AbandonAlert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

/// Mapper used across tests: listings, proposals referencing listings,
/// and users with a field that must never leave the primary store.
pub fn test_mapper() -> TableMapper {
    TableMapper::builder(1)
        .table(
            "listing",
            TableMapping::new("Listing").field("title", "Name").field("price", "Price"),
        )
        .table(
            "proposal",
            TableMapping::new("Proposal")
                .field("amount", "Amount")
                .field("listing_id", "Listing")
                .foreign_key("listing_id", "listing"),
        )
        .table(
            "user",
            TableMapping::new("User").field("email", "Email").exclude("password_hash"),
        )
        .build()
}

pub fn test_config(dir: &Path) -> SyncQueueConfig {
    SyncQueueConfig::for_testing(&dir.join("queue.db").to_string_lossy())
}

/// Engine wired to a mock API and a recording sink, not yet started.
pub fn test_engine(
    config: SyncQueueConfig,
    api: Arc<MockExternalApi>,
    alerts: Arc<RecordingAlertSink>,
) -> SyncQueueEngine<MockExternalApi> {
    SyncQueueEngine::with_external_api(config, test_mapper(), api).with_alert_sink(alerts)
}

/// Enqueue one item in its own committed transaction.
pub async fn enqueue_committed<A: sync_queue::ExternalApi>(
    engine: &SyncQueueEngine<A>,
    table: &str,
    record_id: &str,
    operation: Operation,
    payload: Value,
) -> i64 {
    let store = engine.store().expect("engine started");
    let mut tx = store.begin().await.unwrap();
    let sequence = engine
        .enqueuer()
        .enqueue(&mut tx, table, record_id, operation, payload)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    sequence
}

pub async fn status_of(store: &SyncQueueStore, sequence: i64) -> ItemStatus {
    store.get(sequence).await.unwrap().unwrap().status
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the item reaches `status`; panics with the last status otherwise.
pub async fn wait_for_status(store: &SyncQueueStore, sequence: i64, status: ItemStatus) {
    let reached = wait_for(Duration::from_secs(5), || async {
        status_of(store, sequence).await == status
    })
    .await;
    assert!(
        reached,
        "item {} never reached {}, last status {}",
        sequence,
        status,
        status_of(store, sequence).await
    );
}

// =============================================================================
// Manually driven processor
// =============================================================================

/// A processor with no background task: tests call `process` and
/// `drain_ready` themselves and inspect wake-ups on `wake_rx`.
pub struct Harness {
    pub store: SyncQueueStore,
    pub enqueuer: Enqueuer,
    pub api: Arc<MockExternalApi>,
    pub alerts: Arc<RecordingAlertSink>,
    pub processor: Arc<Processor<MockExternalApi>>,
    pub dispatcher: TriggerDispatcher,
    pub wake_rx: mpsc::Receiver<WakeSignal>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
    _dir: TempDir,
}

pub fn test_settings() -> SyncSettings {
    SyncSettings {
        processor: ProcessorConfig::for_testing(),
        retry: RetrySettings::for_testing(),
        ..SyncSettings::default()
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: SyncSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncQueueStore::open(dir.path().join("queue.db")).await.unwrap();
        let mapper = Arc::new(test_mapper());
        let api = Arc::new(MockExternalApi::new());
        let alerts = Arc::new(RecordingAlertSink::default());
        let (wake_tx, wake_rx) = mpsc::channel(64);
        let dispatcher = TriggerDispatcher::new(wake_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let circuit = settings
            .processor
            .circuit_config()
            .map(|cfg| Arc::new(ExternalApiCircuit::with_config(cfg)));

        let processor = Arc::new(Processor::new(
            store.clone(),
            Arc::clone(&mapper),
            Arc::clone(&api),
            alerts.clone(),
            dispatcher.clone(),
            circuit,
            &settings,
        ));

        Self {
            store,
            enqueuer: Enqueuer::new(mapper),
            api,
            alerts,
            processor,
            dispatcher,
            wake_rx,
            shutdown_tx,
            shutdown_rx,
            _dir: dir,
        }
    }

    /// Enqueue one item in its own committed transaction.
    pub async fn enqueue(&self, table: &str, record_id: &str, operation: Operation, payload: Value) -> i64 {
        let mut tx = self.store.begin().await.unwrap();
        let sequence = self
            .enqueuer
            .enqueue(&mut tx, table, record_id, operation, payload)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        sequence
    }

    pub async fn status(&self, sequence: i64) -> ItemStatus {
        status_of(&self.store, sequence).await
    }

    /// Drain repeatedly, letting backoff elapse in between, until nothing is
    /// owed to the external system or `rounds` runs out.
    pub async fn drain_until_settled(&self, rounds: usize) {
        for _ in 0..rounds {
            self.processor.drain_ready(&self.shutdown_rx).await.unwrap();
            let stats = self.store.stats().await.unwrap();
            if stats.pending + stats.failed == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
