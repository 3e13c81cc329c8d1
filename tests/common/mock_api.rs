//! Mock ExternalApi for testing.
//!
//! Records every write the processor sends, in arrival order. Responses are
//! configurable: a script of errors consumed one per call, a permanent
//! failure mode, per-entity rejection, and artificial latency.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use sync_queue::external::{BoxFuture, ExternalApi, ExternalError};
use sync_queue::{ExternalWrite, Operation};
use tokio::sync::RwLock;

/// Mock implementation of ExternalApi that records all calls.
///
/// # Example
/// ```rust,ignore
/// let api = Arc::new(MockExternalApi::new());
/// api.fail_next(vec![ExternalError::from_status(503, "busy")]).await;
///
/// // Use in tests...
///
/// let calls = api.calls().await;
/// assert_eq!(calls.len(), 2);
/// ```
pub struct MockExternalApi {
    /// Every write received, including failed ones
    calls: RwLock<Vec<ExternalWrite>>,
    /// Errors returned by the next calls, in order
    script: RwLock<VecDeque<ExternalError>>,
    /// Returned for every call once the script is empty
    always: RwLock<Option<ExternalError>>,
    /// Entities rejected with a validation error
    rejected_entities: RwLock<HashMap<String, String>>,
    /// Entities whose writes panic the calling task
    panicking_entities: RwLock<HashSet<String>>,
    latency: RwLock<Duration>,
    applied: AtomicUsize,
}

impl MockExternalApi {
    /// Create a mock that applies every write.
    pub fn new() -> Self {
        Self {
            calls: RwLock::new(Vec::new()),
            script: RwLock::new(VecDeque::new()),
            always: RwLock::new(None),
            rejected_entities: RwLock::new(HashMap::new()),
            panicking_entities: RwLock::new(HashSet::new()),
            latency: RwLock::new(Duration::ZERO),
            applied: AtomicUsize::new(0),
        }
    }

    /// Fail the next calls with these errors, then recover.
    pub async fn fail_next(&self, errors: Vec<ExternalError>) {
        self.script.write().await.extend(errors);
    }

    /// Fail every call with `error` until [`recover`](Self::recover).
    #[allow(dead_code)]
    pub async fn fail_always(&self, error: ExternalError) {
        *self.always.write().await = Some(error);
    }

    #[allow(dead_code)]
    pub async fn recover(&self) {
        *self.always.write().await = None;
        self.script.write().await.clear();
    }

    /// Reject every write for `entity` with a validation error.
    #[allow(dead_code)]
    pub async fn reject_entity(&self, entity: &str, message: &str) {
        self.rejected_entities
            .write()
            .await
            .insert(entity.to_string(), message.to_string());
    }

    /// Panic inside every write for `entity`, as a buggy client would.
    #[allow(dead_code)]
    pub async fn panic_on_entity(&self, entity: &str) {
        self.panicking_entities.write().await.insert(entity.to_string());
    }

    #[allow(dead_code)]
    pub async fn stop_panicking(&self) {
        self.panicking_entities.write().await.clear();
    }

    /// Delay every call by `latency` before answering.
    #[allow(dead_code)]
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    /// Get all recorded calls.
    pub async fn calls(&self) -> Vec<ExternalWrite> {
        self.calls.read().await.clone()
    }

    /// Recorded calls for one external id, in arrival order.
    #[allow(dead_code)]
    pub async fn calls_for(&self, external_id: &str) -> Vec<ExternalWrite> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|w| w.external_id == external_id)
            .cloned()
            .collect()
    }

    /// Operations received for one external id, in arrival order.
    #[allow(dead_code)]
    pub async fn operations_for(&self, external_id: &str) -> Vec<Operation> {
        self.calls_for(external_id).await.into_iter().map(|w| w.operation).collect()
    }

    #[allow(dead_code)]
    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Writes the mock reported as applied.
    #[allow(dead_code)]
    pub fn applied_count(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    async fn respond(&self, write: ExternalWrite) -> Result<(), ExternalError> {
        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let entity = write.entity.clone();
        let panics = self.panicking_entities.read().await.contains(&entity);
        if panics {
            panic!("mock external API panicked on {}", entity);
        }
        self.calls.write().await.push(write);

        if let Some(message) = self.rejected_entities.read().await.get(&entity) {
            return Err(ExternalError::Validation(message.clone()));
        }
        if let Some(error) = self.script.write().await.pop_front() {
            return Err(error);
        }
        if let Some(error) = self.always.read().await.clone() {
            return Err(error);
        }

        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for MockExternalApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalApi for MockExternalApi {
    fn write(&self, write: ExternalWrite) -> BoxFuture<'_, ()> {
        Box::pin(self.respond(write))
    }
}
