//! # Sync Queue
//!
//! Outbound replication from a primary SQLite store to a legacy system of
//! record that cannot be retired yet.
//!
//! ## Architecture
//!
//! Every create/update/delete a request handler commits to the primary store
//! also appends a row to `sync_queue` in the *same* transaction. After commit
//! the handler fires a wake-up; a background processor drains the queue to
//! the external API. Nothing downstream of commit can fail the request.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │ request transaction                                                      │
//! │   primary write ──► Enqueuer::enqueue ──► sync_queue (pending)           │
//! └──────────────────────────────────────────┬───────────────────────────────┘
//!                        commit, dispatch()  │
//!                                            ▼
//! ┌──────────────┐  WakeSignal  ┌──────────────────┐  ExternalWrite  ┌───────┐
//! │  Reconciler  │─────────────►│    Processor     │────────────────►│legacy │
//! │ (every 5 m)  │              │ mapper, FK park, │  circuit, rate  │  API  │
//! └──────────────┘              │ retry, alerts    │  limit, timeout └───────┘
//!                               └──────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Atomicity**: a rolled-back transaction leaves no queue item
//! 2. **Per-record ordering**: operations on one record reach the external
//!    system in `sequence` order; a `failed` item blocks its record
//! 3. **FK deferral**: a child is parked, not failed, until its parent's
//!    INSERT has succeeded
//! 4. **Bounded retry**: transient failures back off exponentially and are
//!    abandoned (with an operator alert) after `max_attempts`
//! 5. **Liveness**: lost wake-ups are caught by the periodic reconciler
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sync_queue::{SyncQueueConfig, SyncQueueEngine, TableMapper, TableMapping};
//!
//! #[tokio::main]
//! async fn main() -> sync_queue::Result<()> {
//!     let mapper = TableMapper::builder(1)
//!         .table("listing", TableMapping::new("Listing").field("title", "Name"))
//!         .build();
//!
//!     let mut engine = SyncQueueEngine::new(SyncQueueConfig::default(), mapper);
//!     engine.start().await?;
//!
//!     // Hand engine.enqueuer() and engine.dispatcher() to request handlers
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod enqueue;
pub mod error;
pub mod external;
pub mod fk;
pub mod http;
pub mod item;
pub mod mapper;
pub mod metrics;
pub mod resilience;
pub mod store;
pub mod trigger;

// Re-exports for convenience
pub use alert::{AbandonAlert, AbandonKind, AlertSink, LogAlertSink};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, ExternalApiCircuit};
pub use config::{
    ProcessorConfig, ReconcilerConfig, RetrySettings, StoreConfig, SyncQueueConfig, SyncSettings,
};
pub use coordinator::{EngineState, HealthCheck, ProcessOutcome, Processor, SyncQueueEngine};
pub use enqueue::{BatchEnqueuer, Enqueuer};
pub use error::{Result, SyncQueueError};
pub use external::{ExternalApi, ExternalError, NoOpExternalApi};
pub use http::HttpExternalApi;
pub use item::{ItemStatus, Operation, RecordKey, SyncQueueItem};
pub use mapper::{ExternalWrite, MappingError, TableMapper, TableMapping};
pub use resilience::RetryPolicy;
pub use store::{QueueStats, SyncQueueStore};
pub use trigger::{TriggerDispatcher, WakeSignal};
