// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-path enqueuer.
//!
//! Request handlers call [`Enqueuer::enqueue`] inside the same transaction as
//! the primary write it describes, before commit:
//!
//! ```rust,no_run
//! # use sync_queue::{Enqueuer, Operation, SyncQueueStore, TriggerDispatcher};
//! # async fn handler(store: &SyncQueueStore, enqueuer: &Enqueuer, trigger: &TriggerDispatcher)
//! #     -> sync_queue::Result<()> {
//! let mut tx = store.begin().await?;
//! sqlx::query("UPDATE listing SET title = ? WHERE id = ?")
//!     .bind("Loft")
//!     .bind("L1")
//!     .execute(&mut *tx)
//!     .await?;
//! enqueuer
//!     .enqueue(&mut tx, "listing", "L1", Operation::Update, serde_json::json!({"title": "Loft"}))
//!     .await?;
//! tx.commit().await?;
//!
//! trigger.dispatch(); // after commit, never fails the request
//! # Ok(())
//! # }
//! ```
//!
//! An error from `enqueue` must abort the transaction. Nothing downstream of
//! commit can fail the request.

use crate::error::{Result, SyncQueueError};
use crate::item::{Operation, RecordKey};
use crate::mapper::TableMapper;
use crate::store::SyncQueueStore;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use tracing::{debug, warn};

/// Appends queue items on the caller's connection.
#[derive(Debug, Clone)]
pub struct Enqueuer {
    mapper: Arc<TableMapper>,
}

impl Enqueuer {
    pub fn new(mapper: Arc<TableMapper>) -> Self {
        Self { mapper }
    }

    /// Append one item and return its sequence.
    ///
    /// `payload` must be a JSON object: the full record for INSERT, changed
    /// fields for UPDATE, the key for DELETE. Fields the mapper does not
    /// replicate are dropped here; a table the mapper does not know is stored
    /// as-is and abandoned later by the processor.
    pub async fn enqueue(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        record_id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<i64> {
        self.append(conn, &uuid::Uuid::new_v4().to_string(), table, record_id, operation, payload)
            .await
    }

    /// Start a batch: every item enqueued through it shares one batch id.
    pub fn batch(&self) -> BatchEnqueuer<'_> {
        BatchEnqueuer {
            enqueuer: self,
            batch_id: uuid::Uuid::new_v4().to_string(),
            sequences: Vec::new(),
        }
    }

    async fn append(
        &self,
        conn: &mut SqliteConnection,
        batch_id: &str,
        table: &str,
        record_id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<i64> {
        let fields = match payload {
            Value::Object(fields) => fields,
            other => {
                return Err(SyncQueueError::invalid_payload(
                    table,
                    record_id,
                    format!("expected a JSON object, got {}", json_kind(&other)),
                ))
            }
        };
        if record_id.is_empty() {
            return Err(SyncQueueError::invalid_payload(table, record_id, "empty record id"));
        }

        if !self.mapper.contains(table) {
            warn!(table, record_id, "Enqueuing change for unmapped table");
        }

        let filtered = self.mapper.filter_payload(table, fields);
        let payload = serde_json::to_string(&filtered)?;
        let key = RecordKey::new(table, record_id);

        let sequence = SyncQueueStore::insert_item(conn, batch_id, &key, operation, &payload).await?;

        debug!(sequence, table, record_id, operation = %operation, "Enqueued sync item");
        crate::metrics::record_enqueued(table, operation.as_str());
        Ok(sequence)
    }

    pub fn mapper(&self) -> &TableMapper {
        &self.mapper
    }
}

/// Enqueues several items under one batch id (one originating transaction).
#[derive(Debug)]
pub struct BatchEnqueuer<'a> {
    enqueuer: &'a Enqueuer,
    batch_id: String,
    sequences: Vec<i64>,
}

impl BatchEnqueuer<'_> {
    pub async fn enqueue(
        &mut self,
        conn: &mut SqliteConnection,
        table: &str,
        record_id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<i64> {
        let sequence = self
            .enqueuer
            .append(conn, &self.batch_id, table, record_id, operation, payload)
            .await?;
        self.sequences.push(sequence);
        Ok(sequence)
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Sequences enqueued so far, in order.
    pub fn sequences(&self) -> &[i64] {
        &self.sequences
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemStatus;
    use crate::mapper::TableMapping;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn setup() -> (SyncQueueStore, Enqueuer, TempDir) {
        let dir = tempdir().unwrap();
        let store = SyncQueueStore::open(dir.path().join("queue.db")).await.unwrap();
        let mapper = TableMapper::builder(1)
            .table(
                "listing",
                TableMapping::new("Listing").field("title", "Name").field("price", "Price"),
            )
            .build();
        (store, Enqueuer::new(Arc::new(mapper)), dir)
    }

    #[tokio::test]
    async fn test_enqueue_filters_unmapped_fields() {
        let (store, enqueuer, _dir) = setup().await;
        let mut tx = store.begin().await.unwrap();
        let seq = enqueuer
            .enqueue(&mut tx, "listing", "L1", Operation::Insert, json!({"title": "Loft", "secret": 1}))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let item = store.get(seq).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.payload.len(), 1);
        assert_eq!(item.payload["title"], "Loft");
    }

    #[tokio::test]
    async fn test_enqueue_unmapped_table_stored_unfiltered() {
        let (store, enqueuer, _dir) = setup().await;
        let mut conn = store.pool().acquire().await.unwrap();
        let seq = enqueuer
            .enqueue(&mut conn, "ghost", "G1", Operation::Update, json!({"anything": true}))
            .await
            .unwrap();

        let item = store.get(seq).await.unwrap().unwrap();
        assert_eq!(item.payload["anything"], true);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_non_object_payload() {
        let (store, enqueuer, _dir) = setup().await;
        let mut conn = store.pool().acquire().await.unwrap();
        let err = enqueuer
            .enqueue(&mut conn, "listing", "L1", Operation::Insert, json!([1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncQueueError::InvalidPayload { .. }));
        assert!(err.to_string().contains("an array"));
        assert_eq!(store.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_record_id() {
        let (store, enqueuer, _dir) = setup().await;
        let mut conn = store.pool().acquire().await.unwrap();
        let err = enqueuer
            .enqueue(&mut conn, "listing", "", Operation::Delete, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncQueueError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn test_rollback_discards_item() {
        let (store, enqueuer, _dir) = setup().await;
        let mut tx = store.begin().await.unwrap();
        enqueuer
            .enqueue(&mut tx, "listing", "L1", Operation::Insert, json!({"title": "Loft"}))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.items_for_record(&RecordKey::new("listing", "L1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_shares_id_and_orders_sequences() {
        let (store, enqueuer, _dir) = setup().await;
        let mut tx = store.begin().await.unwrap();
        let mut batch = enqueuer.batch();
        let a = batch
            .enqueue(&mut tx, "listing", "L1", Operation::Insert, json!({"title": "A"}))
            .await
            .unwrap();
        let b = batch
            .enqueue(&mut tx, "listing", "L1", Operation::Update, json!({"price": 10}))
            .await
            .unwrap();
        let batch_id = batch.batch_id().to_string();
        assert_eq!(batch.sequences(), &[a, b]);
        tx.commit().await.unwrap();

        assert!(b > a);
        let items = store.items_for_record(&RecordKey::new("listing", "L1")).await.unwrap();
        assert!(items.iter().all(|i| i.batch_id == batch_id));
    }

    #[tokio::test]
    async fn test_separate_enqueues_get_distinct_batches() {
        let (store, enqueuer, _dir) = setup().await;
        let mut conn = store.pool().acquire().await.unwrap();
        let a = enqueuer
            .enqueue(&mut conn, "listing", "L1", Operation::Insert, json!({}))
            .await
            .unwrap();
        let b = enqueuer
            .enqueue(&mut conn, "listing", "L2", Operation::Insert, json!({}))
            .await
            .unwrap();
        let a = store.get(a).await.unwrap().unwrap();
        let b = store.get(b).await.unwrap().unwrap();
        assert_ne!(a.batch_id, b.batch_id);
    }
}
