//! Configuration for the sync queue.
//!
//! Configuration is passed to [`SyncQueueEngine::new()`](crate::SyncQueueEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use sync_queue::config::{StoreConfig, SyncQueueConfig};
//!
//! let config = SyncQueueConfig {
//!     store: StoreConfig {
//!         sqlite_path: "/var/lib/app/primary.db".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert_eq!(config.settings.retry.max_attempts, 5);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncQueueConfig
//! ├── settings: SyncSettings
//! │   ├── processor: ProcessorConfig   # worker pool, timeouts, circuit, rate limit
//! │   ├── retry: RetrySettings         # backoff curve, max attempts
//! │   └── reconciler: ReconcilerConfig # periodic safety-net sweep
//! └── store: StoreConfig               # SQLite database shared with the primary tables
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! settings:
//!   processor:
//!     max_workers: 8
//!     request_timeout: "10s"
//!   retry:
//!     max_attempts: 5
//!     initial_delay: "1s"
//!     max_delay: "5m"
//!   reconciler:
//!     interval: "5m"
//!     staleness: "5m"
//!
//! store:
//!   sqlite_path: "/var/lib/app/primary.db"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::resilience::{RateLimitConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `SyncQueueEngine::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncQueueConfig {
    /// Tunables for processing, retry, and reconciliation.
    #[serde(default)]
    pub settings: SyncSettings,

    /// The SQLite database holding `sync_queue` (the primary database).
    #[serde(default)]
    pub store: StoreConfig,
}

impl SyncQueueConfig {
    /// Create a fast config for tests against the database at `sqlite_path`.
    ///
    /// Short retry delays, no circuit breaker, reconciler disabled (tests drive
    /// sweeps explicitly).
    pub fn for_testing(sqlite_path: &str) -> Self {
        Self {
            settings: SyncSettings {
                processor: ProcessorConfig::for_testing(),
                retry: RetrySettings::for_testing(),
                reconciler: ReconcilerConfig {
                    enabled: false,
                    ..ReconcilerConfig::default()
                },
            },
            store: StoreConfig {
                sqlite_path: sqlite_path.to_string(),
                ..StoreConfig::default()
            },
        }
    }
}

/// General settings for the queue machinery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProcessorConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Distinct records processed concurrently.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Maximum per-record heads claimed per wave.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Capacity of the wake-up channel. A full channel means a wake-up is
    /// already pending.
    #[serde(default = "default_wake_channel_capacity")]
    pub wake_channel_capacity: usize,

    /// How long shutdown waits for the current wave to finish.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Circuit breaker
    // ─────────────────────────────────────────────────────────────────────────

    /// Wrap external calls in a circuit breaker.
    #[serde(default = "default_true")]
    pub circuit_enabled: bool,

    /// Transient failure rate (0.0 - 1.0) that opens the circuit.
    #[serde(default = "default_circuit_failure_rate")]
    pub circuit_failure_rate: f32,

    /// Calls observed before the failure rate is evaluated.
    #[serde(default = "default_circuit_window")]
    pub circuit_window: u32,

    /// How long the circuit stays open before probing.
    #[serde(default = "default_circuit_open_wait")]
    pub circuit_open_wait: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting of outbound external calls.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum calls per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_workers() -> usize {
    8
}

fn default_batch_limit() -> usize {
    256
}

fn default_wake_channel_capacity() -> usize {
    64
}

fn default_drain_timeout() -> String {
    "30s".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_circuit_failure_rate() -> f32 {
    0.5
}

fn default_circuit_window() -> u32 {
    20
}

fn default_circuit_open_wait() -> String {
    "30s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    100
}

fn default_rate_limit_burst() -> u32 {
    20
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            batch_limit: 256,
            wake_channel_capacity: 64,
            drain_timeout: "30s".to_string(),
            circuit_enabled: true,
            circuit_failure_rate: 0.5,
            circuit_window: 20,
            circuit_open_wait: "30s".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 100,
            rate_limit_burst: 20,
        }
    }
}

impl ProcessorConfig {
    pub fn for_testing() -> Self {
        Self {
            max_workers: 4,
            batch_limit: 64,
            drain_timeout: "2s".to_string(),
            circuit_enabled: false,
            ..Self::default()
        }
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.drain_timeout, Duration::from_secs(30))
    }

    /// Circuit breaker configuration, or `None` if disabled.
    pub fn circuit_config(&self) -> Option<CircuitConfig> {
        if !self.circuit_enabled {
            return None;
        }
        Some(CircuitConfig {
            failure_rate: self.circuit_failure_rate,
            window: self.circuit_window,
            recovery_timeout: parse_duration_or(&self.circuit_open_wait, Duration::from_secs(30)),
            ..CircuitConfig::default()
        })
    }

    /// Rate limit configuration, or `None` if disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff and attempt budget for transient external failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts before an item is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Per-call timeout on the external API.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_request_timeout() -> String {
    "10s".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: "1s".to_string(),
            max_delay: "5m".to_string(),
            backoff_factor: 2.0,
            request_timeout: "10s".to_string(),
        }
    }
}

impl RetrySettings {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
            backoff_factor: 2.0,
            request_timeout: "500ms".to_string(),
        }
    }

    /// Resolve into a [`RetryPolicy`]. Invalid durations fall back to defaults.
    pub fn policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: parse_duration_or(&self.initial_delay, defaults.initial_delay),
            max_delay: parse_duration_or(&self.max_delay, defaults.max_delay),
            backoff_factor: if self.backoff_factor >= 1.0 {
                self.backoff_factor
            } else {
                defaults.backoff_factor
            },
            request_timeout: parse_duration_or(&self.request_timeout, defaults.request_timeout),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcilerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Periodic reconciler (safety-net sweep) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to sweep.
    #[serde(default = "default_reconcile_interval")]
    pub interval: String,

    /// Items without a transition for this long are re-signalled.
    #[serde(default = "default_staleness")]
    pub staleness: String,

    /// Maximum items re-signalled per sweep; the rest wait for the next one.
    #[serde(default = "default_max_items_per_sweep")]
    pub max_items_per_sweep: usize,
}

fn default_reconcile_interval() -> String {
    "5m".to_string()
}

fn default_staleness() -> String {
    "5m".to_string()
}

fn default_max_items_per_sweep() -> usize {
    1000
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "5m".to_string(),
            staleness: "5m".to_string(),
            max_items_per_sweep: 1000,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(300))
    }

    pub fn staleness_duration(&self) -> Duration {
        parse_duration_or(&self.staleness, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite store configuration.
///
/// Point this at the primary database: enqueue must share the caller's
/// transaction, which only works when both tables live in the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a connection waits on a locked database before SQLITE_BUSY.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout() -> String {
    "5s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "sync_queue.db".to_string(),
            wal_mode: true,
            max_connections: 8,
            busy_timeout: "5s".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        parse_duration_or(&self.busy_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
