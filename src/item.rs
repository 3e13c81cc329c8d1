// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue item types.
//!
//! # Status State Machine
//!
//! ```text
//!            claim             external ok
//! pending ──────────→ in_flight ───────────→ succeeded
//!    ↑                 │  │  │
//!    │  backoff elapsed │  │  └─ parent unsynced ─→ in_flight (parked)
//!    │                 │  │                             │
//!    └──── failed ←────┘  │                    parent succeeded
//!             │           │                             ↓
//!             │           └─ validation / mapping ─→ abandoned
//!             └──── attempts >= max ───────────────→ abandoned
//! ```
//!
//! `succeeded` and `abandoned` are terminal. A parked item is re-surfaced as
//! `pending` by the FK propagator when its parent succeeds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of change a queue item replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// Processing status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Ready to be claimed.
    Pending,
    /// Claimed by a worker, or parked behind an unsynced parent.
    InFlight,
    /// Applied to the external system. Terminal and immutable.
    Succeeded,
    /// Last attempt failed; waiting for its backoff to elapse.
    Failed,
    /// Poison item. Terminal; needs operator intervention.
    Abandoned,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// `succeeded` and `abandoned` never transition again (short of operator requeue).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Abandoned)
    }

    pub const ALL: [ItemStatus; 5] = [
        Self::Pending,
        Self::InFlight,
        Self::Succeeded,
        Self::Failed,
        Self::Abandoned,
    ];
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Identity of a replicated record: the unit of ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.record_id)
    }
}

/// The unit of replication work.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
    /// Monotonic sequence (store primary key).
    pub sequence: i64,
    /// Shared by every item enqueued in one originating transaction.
    pub batch_id: String,
    pub table: String,
    pub record_id: String,
    pub operation: Operation,
    /// Mapped field data (full record, changed fields, or key only).
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub status: ItemStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Epoch millis.
    pub created_at: i64,
    /// Epoch millis of the last status transition.
    pub updated_at: i64,
    pub processed_at: Option<i64>,
    /// Earliest retry time for a `failed` item.
    pub next_attempt_at: Option<i64>,
    /// Parent this item is parked behind, if any.
    pub parked_on: Option<RecordKey>,
}

impl SyncQueueItem {
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.table, &self.record_id)
    }

    pub fn is_parked(&self) -> bool {
        self.status == ItemStatus::InFlight && self.parked_on.is_some()
    }
}

/// Raw `sync_queue` row as stored in SQLite.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub sequence: i64,
    pub batch_id: String,
    pub table_name: String,
    pub record_id: String,
    pub operation: String,
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub parked_on_table: Option<String>,
    pub parked_on_record: Option<String>,
}

impl TryFrom<ItemRow> for SyncQueueItem {
    type Error = crate::error::SyncQueueError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| crate::error::SyncQueueError::CorruptRow {
            sequence: row.sequence,
            message,
        };

        let operation = row.operation.parse::<Operation>().map_err(corrupt)?;
        let status = row.status.parse::<ItemStatus>().map_err(corrupt)?;
        let payload = match serde_json::from_str::<serde_json::Value>(&row.payload)? {
            serde_json::Value::Object(map) => map,
            other => return Err(corrupt(format!("payload is not an object: {}", other))),
        };
        let parked_on = match (row.parked_on_table, row.parked_on_record) {
            (Some(table), Some(record_id)) => Some(RecordKey { table, record_id }),
            _ => None,
        };

        Ok(Self {
            sequence: row.sequence,
            batch_id: row.batch_id,
            table: row.table_name,
            record_id: row.record_id,
            operation,
            payload,
            status,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
            next_attempt_at: row.next_attempt_at,
            parked_on,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, operation: &str, payload: &str) -> ItemRow {
        ItemRow {
            sequence: 7,
            batch_id: "b-1".to_string(),
            table_name: "listing".to_string(),
            record_id: "L1".to_string(),
            operation: operation.to_string(),
            payload: payload.to_string(),
            status: status.to_string(),
            attempts: 2,
            last_error: None,
            created_at: 1,
            updated_at: 2,
            processed_at: None,
            next_attempt_at: None,
            parked_on_table: None,
            parked_on_record: None,
        }
    }

    #[test]
    fn test_status_strings_match_schema() {
        assert_eq!(ItemStatus::InFlight.as_str(), "in_flight");
        assert_eq!("abandoned".parse::<ItemStatus>(), Ok(ItemStatus::Abandoned));
        assert!("IN_FLIGHT".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ItemStatus::Succeeded.is_terminal());
        assert!(ItemStatus::Abandoned.is_terminal());
        assert!(!ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::InFlight.is_terminal());
    }

    #[test]
    fn test_operation_serde_uses_uppercase() {
        let json = serde_json::to_string(&Operation::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
        assert_eq!("UPDATE".parse::<Operation>(), Ok(Operation::Update));
        assert!("update".parse::<Operation>().is_err());
    }

    #[test]
    fn test_record_key_display() {
        assert_eq!(RecordKey::new("proposal", "P9").to_string(), "proposal/P9");
    }

    #[test]
    fn test_row_conversion() {
        let item = SyncQueueItem::try_from(row("pending", "INSERT", r#"{"title":"Loft"}"#)).unwrap();
        assert_eq!(item.operation, Operation::Insert);
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 2);
        assert_eq!(item.payload["title"], "Loft");
        assert!(!item.is_parked());
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let err = SyncQueueItem::try_from(row("bogus", "INSERT", "{}")).unwrap_err();
        assert!(err.to_string().contains("unknown status"));
    }

    #[test]
    fn test_row_conversion_rejects_non_object_payload() {
        let err = SyncQueueItem::try_from(row("pending", "INSERT", "[1,2]")).unwrap_err();
        assert!(err.to_string().contains("not an object"));
    }

    #[test]
    fn test_parked_item() {
        let mut r = row("in_flight", "UPDATE", "{}");
        r.parked_on_table = Some("listing".to_string());
        r.parked_on_record = Some("L0".to_string());
        let item = SyncQueueItem::try_from(r).unwrap();
        assert!(item.is_parked());
        assert_eq!(item.parked_on, Some(RecordKey::new("listing", "L0")));
    }
}
