//! Circuit breaker around the external write API.
//!
//! A legacy system of record that is down or saturated should not be hammered
//! by every ready item. Uses the `recloser` crate: the breaker watches a
//! sliding window of outcomes and opens when the failure rate crosses the
//! threshold.
//!
//! Only *transient* failures count against the breaker. A validation error
//! means the external system is healthy and rejected one payload, so callers
//! report it as `Ok(Err(validation))`.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: External system unhealthy, calls fail fast; the processor
//!   releases its claim and pauses for `recovery_timeout`
//! - **HalfOpen**: Probing whether the external system recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use sync_queue::circuit_breaker::{ExternalApiCircuit, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = ExternalApiCircuit::new();
//!
//! match circuit.writes.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, pause */ }
//!     Err(CircuitError::Inner(e)) => { /* transient external error */ }
//! }
//! # Ok(())
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if service recovered
    HalfOpen = 1,
    /// Service unhealthy, fail-fast
    Open = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Failure rate (0.0 - 1.0) over the window that trips the circuit.
    pub failure_rate: f32,
    /// Calls observed in the closed state before the rate is evaluated.
    pub window: u32,
    /// Probe calls allowed in half-open before deciding.
    pub half_open_probes: u32,
    /// How long to stay open before probing (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.5,
            window: 20,
            half_open_probes: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with metrics tracking.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    recovery_timeout: Duration,
    last_state: AtomicU8,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate.clamp(0.0, 1.0))
            .closed_len(config.window.max(1) as usize)
            .half_open_len(config.half_open_probes.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            recovery_timeout: config.recovery_timeout,
            last_state: AtomicU8::new(CircuitState::Closed as u8),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How long the circuit stays open before probing.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.transition(CircuitState::Closed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.transition(CircuitState::Open);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn transition(&self, state: CircuitState) {
        let previous = self.last_state.swap(state as u8, Ordering::Relaxed);
        if previous != state as u8 {
            debug!(circuit = %self.name, state = %state, "Circuit state changed");
            crate::metrics::set_circuit_state(&self.name, state);
        }
    }

    /// Last observed state: `Open` after a rejection, `Closed` after a success.
    ///
    /// `recloser` keeps its state private, so the failure that trips the
    /// circuit still reads `Closed`; the next rejected call flips it to
    /// `Open`. Half-open probing is not observed and reads as the prior state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.last_state.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (transient errors).
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

/// Circuit breaker for the external system of record.
pub struct ExternalApiCircuit {
    /// Circuit for write calls (create, update, delete)
    pub writes: CircuitBreaker,
}

impl Default for ExternalApiCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalApiCircuit {
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new("external_writes", config),
        }
    }

    pub fn metrics(&self) -> ExternalApiCircuitMetrics {
        ExternalApiCircuitMetrics {
            state: self.writes.state(),
            writes_total: self.writes.calls_total(),
            writes_successes: self.writes.successes(),
            writes_failures: self.writes.failures(),
            writes_rejections: self.writes.rejections(),
        }
    }

    /// Whether the last observed call was rejected. See [`CircuitBreaker::state`].
    pub fn is_open(&self) -> bool {
        self.writes.state() == CircuitState::Open
    }
}

/// Snapshot of the external API circuit.
#[derive(Debug, Clone)]
pub struct ExternalApiCircuitMetrics {
    pub state: CircuitState,
    pub writes_total: u64,
    pub writes_successes: u64,
    pub writes_failures: u64,
    pub writes_rejections: u64,
}
