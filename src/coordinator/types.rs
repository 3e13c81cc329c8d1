//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (store open, recovery done)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(store or recovery error)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: after `SyncQueueEngine::new()`. Handlers may already hold an
//!   enqueuer and a dispatcher; wake-ups buffer until start.
//! - **Starting**: opening the store and recovering items left by a crash.
//! - **Running**: processor and reconciler tasks are live.
//! - **ShuttingDown**: the current wave is finishing.
//! - **Stopped**: tasks joined, store closed. Safe to drop.
//! - **Failed**: start-up failed. Check logs.

use crate::circuit_breaker::CircuitState;
use crate::store::QueueStats;
use serde::Serialize;

/// State of the sync queue engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::SyncQueueEngine::start) to begin processing.
    Created,

    /// Opening the store and running crash recovery.
    Starting,

    /// Processing wake-ups and sweeping for stale items.
    Running,

    /// Shutting down gracefully.
    ///
    /// The wave in progress is allowed to finish, bounded by the drain timeout.
    ShuttingDown,

    /// Stopped cleanly.
    Stopped,

    /// Failed to start.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health snapshot, suitable for `/health` and `/ready`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and the external API circuit is not open.
    pub ready: bool,
    /// Last observed circuit state; `None` when the circuit breaker is disabled.
    pub circuit_state: Option<CircuitState>,
    /// `None` before the store is open, or if the count query failed.
    pub queue: Option<QueueStats>,
    pub mapper_version: u32,
}

impl HealthCheck {
    /// Items still owed to the external system.
    pub fn backlog(&self) -> u64 {
        self.queue.map(|q| q.backlog()).unwrap_or(0)
    }

    /// Items waiting on an operator.
    pub fn abandoned(&self) -> u64 {
        self.queue.map(|q| q.abandoned).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_equality() {
        assert_eq!(EngineState::Created, EngineState::Created);
        assert_ne!(EngineState::Created, EngineState::Running);
    }

    #[test]
    fn test_health_counts_without_store() {
        let health = HealthCheck {
            state: EngineState::Created,
            ready: false,
            circuit_state: None,
            queue: None,
            mapper_version: 1,
        };
        assert_eq!(health.backlog(), 0);
        assert_eq!(health.abandoned(), 0);
    }

    #[test]
    fn test_health_serializes() {
        let health = HealthCheck {
            state: EngineState::Running,
            ready: true,
            circuit_state: None,
            queue: Some(QueueStats {
                pending: 3,
                failed: 1,
                abandoned: 2,
                ..QueueStats::default()
            }),
            mapper_version: 7,
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["state"], "Running");
        assert_eq!(json["queue"]["pending"], 3);
        assert_eq!(json["mapper_version"], 7);
        assert_eq!(health.abandoned(), 2);
    }
}
