// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable queue store.
//!
//! The `sync_queue` table lives in the same SQLite database as the primary
//! tables, so [`Enqueuer::enqueue`](crate::enqueue::Enqueuer::enqueue) joins
//! the caller's transaction: if the primary write rolls back, so does the
//! queue item.
//!
//! # Compare-and-swap transitions
//!
//! Every status change is an `UPDATE ... WHERE sequence = ? AND status = ?`.
//! A transition that affects zero rows lost a race (another worker, the
//! reconciler, an operator) and is reported to the caller rather than forced.
//!
//! # Per-record heads
//!
//! A record's *head* is its oldest non-terminal item. Only a `pending` head is
//! claimable; an `in_flight` or `failed` head blocks every later item of the
//! same record, which is what serializes a record by `sequence`.
//!
//! # FK dependency index
//!
//! `sync_queue_dependencies` maps a parent record to the sequences parked
//! behind it. Parking and releasing run in one transaction with the status
//! change that causes them:
//!
//! ```text
//! park:    UPDATE child SET parked_on ...   (takes the write lock)
//!          SELECT latest parent INSERT      (consistent with the lock)
//!          INSERT dependency row            -> commit
//!
//! succeed: UPDATE parent SET succeeded
//!          UPDATE children SET pending      -> commit
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended (request handlers write to it too). Single statements and whole
//! transitions are retried with exponential backoff via [`execute_with_retry`].

use crate::config::StoreConfig;
use crate::error::{Result, SyncQueueError};
use crate::item::{ItemRow, ItemStatus, Operation, RecordKey, SyncQueueItem};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_queue (
        sequence         INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id         TEXT    NOT NULL,
        table_name       TEXT    NOT NULL,
        record_id        TEXT    NOT NULL,
        operation        TEXT    NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
        payload          TEXT    NOT NULL,
        status           TEXT    NOT NULL DEFAULT 'pending'
                         CHECK (status IN ('pending', 'in_flight', 'succeeded', 'failed', 'abandoned')),
        attempts         INTEGER NOT NULL DEFAULT 0,
        last_error       TEXT,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        processed_at     INTEGER,
        next_attempt_at  INTEGER,
        parked_on_table  TEXT,
        parked_on_record TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_record ON sync_queue (table_name, record_id, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_status_created ON sync_queue (status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_status_updated ON sync_queue (status, updated_at)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_queue_dependencies (
        parent_table       TEXT    NOT NULL,
        parent_record_id   TEXT    NOT NULL,
        dependent_sequence INTEGER NOT NULL,
        created_at         INTEGER NOT NULL,
        PRIMARY KEY (parent_table, parent_record_id, dependent_sequence)
    )
    "#,
];

const ITEM_COLUMNS: &str = "sequence, batch_id, table_name, record_id, operation, payload, status, \
     attempts, last_error, created_at, updated_at, processed_at, next_attempt_at, \
     parked_on_table, parked_on_record";

/// SQL predicate on `q.payload`: valid JSON whose top level is an object.
/// `CASE` keeps `json_type` away from malformed text, which would raise.
const READABLE_PAYLOAD: &str =
    "CASE WHEN json_valid(q.payload) THEN json_type(q.payload) = 'object' ELSE 0 END";

/// Current wall clock as epoch millis.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Result of trying to park an item behind a parent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParkOutcome {
    /// Parked; the item stays `in_flight` until the parent succeeds.
    Parked,
    /// The parent is already replicated (or pre-dates the queue).
    Resolved,
    /// The parent's INSERT was abandoned; the dependent can never succeed.
    ParentAbandoned,
    /// The item was no longer claimed by us.
    Lost,
}

/// Replication state of a parent record, judged by its latest INSERT item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentState {
    Resolved,
    Unresolved,
    Abandoned,
}

impl ParentState {
    fn from_latest_insert(status: Option<&str>) -> Self {
        match status {
            None | Some("succeeded") => Self::Resolved,
            Some("abandoned") => Self::Abandoned,
            Some(_) => Self::Unresolved,
        }
    }
}

/// Outcome of abandoning an item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Abandonment {
    /// Whether the item itself transitioned (false = lost the CAS).
    pub transitioned: bool,
    /// Parked dependents abandoned along with it.
    pub cascaded: Vec<i64>,
}

/// What start-up dependency reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    /// Parked items released back to `pending`.
    pub released: Vec<i64>,
    /// Parked items abandoned because their parent was abandoned.
    pub abandoned: Vec<i64>,
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    /// Includes parked items.
    pub in_flight: u64,
    pub parked: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
}

impl QueueStats {
    /// Items that still need work.
    pub fn backlog(&self) -> u64 {
        self.pending + self.in_flight + self.failed
    }

    pub fn get(&self, status: ItemStatus) -> u64 {
        match status {
            ItemStatus::Pending => self.pending,
            ItemStatus::InFlight => self.in_flight,
            ItemStatus::Succeeded => self.succeeded,
            ItemStatus::Failed => self.failed,
            ItemStatus::Abandoned => self.abandoned,
        }
    }
}

/// Strongly-typed repository over the `sync_queue` table.
#[derive(Debug, Clone)]
pub struct SyncQueueStore {
    pool: SqlitePool,
}

impl SyncQueueStore {
    /// Open (or create) the queue store at `path` with default settings.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = StoreConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..StoreConfig::default()
        };
        Self::open_with(&config).await
    }

    /// Open (or create) the queue store described by `config`.
    ///
    /// Creates the tables and indexes if they don't exist.
    pub async fn open_with(config: &StoreConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Opening sync queue store");

        let journal_mode = if config.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
            .map_err(|e| SyncQueueError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool (the application's own), creating the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA.iter().copied() {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// The underlying pool, shared with the primary tables.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction for a primary write plus its enqueue.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Append
    // ─────────────────────────────────────────────────────────────────────────

    /// Append one `pending` item on the caller's connection.
    pub(crate) async fn insert_item(
        conn: &mut SqliteConnection,
        batch_id: &str,
        key: &RecordKey,
        operation: Operation,
        payload: &str,
    ) -> Result<i64> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO sync_queue
                (batch_id, table_name, record_id, operation, payload, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(batch_id)
        .bind(&key.table)
        .bind(&key.record_id)
        .bind(operation.as_str())
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get(&self, sequence: i64) -> Result<Option<SyncQueueItem>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sync_queue WHERE sequence = ?",
            ITEM_COLUMNS
        ))
        .bind(sequence)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncQueueItem::try_from).transpose()
    }

    /// Every item of one record, oldest first.
    pub async fn items_for_record(&self, key: &RecordKey) -> Result<Vec<SyncQueueItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sync_queue WHERE table_name = ? AND record_id = ? ORDER BY sequence",
            ITEM_COLUMNS
        ))
        .bind(&key.table)
        .bind(&key.record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncQueueItem::try_from).collect()
    }

    /// Claimable per-record heads, oldest first. At most one item per record.
    ///
    /// Heads with an unreadable payload are left out before the limit applies;
    /// they still block later items of their own record.
    pub async fn next_ready(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM sync_queue q
            WHERE q.status = 'pending'
              AND {}
              AND NOT EXISTS (
                  SELECT 1 FROM sync_queue e
                  WHERE e.table_name = q.table_name
                    AND e.record_id = q.record_id
                    AND e.sequence < q.sequence
                    AND e.status IN ('pending', 'in_flight', 'failed')
              )
            ORDER BY q.sequence
            LIMIT ?
            "#,
            ITEM_COLUMNS, READABLE_PAYLOAD
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match SyncQueueItem::try_from(row) {
                Ok(item) => Some(item),
                Err(e) => {
                    error!(error = %e, "Skipping unreadable queue row");
                    crate::metrics::record_corrupt_row();
                    None
                }
            })
            .collect())
    }

    /// Pending items whose payload cannot be decoded. Each one stalls its record.
    pub async fn count_unreadable(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM sync_queue q WHERE q.status = 'pending' AND NOT ({})",
            READABLE_PAYLOAD
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Whether a DELETE for `key` older than `before_sequence` already succeeded.
    pub async fn has_succeeded_delete(&self, key: &RecordKey, before_sequence: i64) -> Result<bool> {
        let found: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sync_queue
                WHERE table_name = ? AND record_id = ? AND operation = 'DELETE'
                  AND status = 'succeeded' AND sequence < ?
            )
            "#,
        )
        .bind(&key.table)
        .bind(&key.record_id)
        .bind(before_sequence)
        .fetch_one(&self.pool)
        .await?;

        Ok(found != 0)
    }

    /// Retryable items with no transition since `cutoff_ms`.
    ///
    /// `failed` items are only returned once their backoff deadline has passed.
    pub async fn find_stale(&self, cutoff_ms: i64, now_ms: i64, limit: usize) -> Result<Vec<i64>> {
        let sequences: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT sequence FROM sync_queue
            WHERE (status = 'pending' AND updated_at <= ?)
               OR (status = 'failed' AND updated_at <= ?
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?))
            ORDER BY sequence
            LIMIT ?
            "#,
        )
        .bind(cutoff_ms)
        .bind(cutoff_ms)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(sequences)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<ItemStatus>() {
                Ok(ItemStatus::Pending) => stats.pending = count,
                Ok(ItemStatus::InFlight) => stats.in_flight = count,
                Ok(ItemStatus::Succeeded) => stats.succeeded = count,
                Ok(ItemStatus::Failed) => stats.failed = count,
                Ok(ItemStatus::Abandoned) => stats.abandoned = count,
                Err(e) => warn!(error = %e, "Ignoring unknown status in stats"),
            }
        }

        let parked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_queue WHERE status = 'in_flight' AND parked_on_table IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.parked = parked.max(0) as u64;

        Ok(stats)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// `pending -> in_flight`, only while the item is still its record's head.
    pub async fn claim(&self, sequence: i64) -> Result<bool> {
        let pool = &self.pool;
        let now = now_millis();

        let result = execute_with_retry("claim", || async {
            sqlx::query(
                r#"
                UPDATE sync_queue SET status = 'in_flight', updated_at = ?
                WHERE sequence = ? AND status = 'pending'
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_queue e
                      WHERE e.table_name = sync_queue.table_name
                        AND e.record_id = sync_queue.record_id
                        AND e.sequence < sync_queue.sequence
                        AND e.status IN ('pending', 'in_flight', 'failed')
                  )
                "#,
            )
            .bind(now)
            .bind(sequence)
            .execute(pool)
            .await
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `in_flight -> pending` without touching attempts (circuit open, shutdown).
    pub async fn release_claim(&self, sequence: i64) -> Result<bool> {
        let pool = &self.pool;
        let now = now_millis();

        let result = execute_with_retry("release_claim", || async {
            sqlx::query(
                r#"
                UPDATE sync_queue SET status = 'pending', updated_at = ?
                WHERE sequence = ? AND status = 'in_flight' AND parked_on_table IS NULL
                "#,
            )
            .bind(now)
            .bind(sequence)
            .execute(pool)
            .await
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `in_flight -> succeeded`, releasing dependents in the same transaction.
    ///
    /// Returns `None` if the item was not `in_flight`, otherwise the sequences
    /// released back to `pending`.
    pub async fn mark_succeeded(&self, sequence: i64) -> Result<Option<Vec<i64>>> {
        let now = now_millis();
        Ok(execute_with_retry("mark_succeeded", || self.mark_succeeded_tx(sequence, now)).await?)
    }

    async fn mark_succeeded_tx(&self, sequence: i64, now: i64) -> sqlx::Result<Option<Vec<i64>>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'succeeded', processed_at = ?, updated_at = ?, next_attempt_at = NULL
            WHERE sequence = ? AND status = 'in_flight' AND parked_on_table IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(sequence)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let key: (String, String) =
            sqlx::query_as("SELECT table_name, record_id FROM sync_queue WHERE sequence = ?")
                .bind(sequence)
                .fetch_one(&mut *tx)
                .await?;
        let parent = RecordKey::new(key.0, key.1);

        let released = match parent_state(&mut tx, &parent).await? {
            ParentState::Resolved => release_dependents(&mut tx, &parent, now).await?,
            _ => Vec::new(),
        };

        tx.commit().await?;
        Ok(Some(released))
    }

    /// `in_flight -> failed` with the new attempt count and backoff deadline.
    pub async fn mark_failed(
        &self,
        sequence: i64,
        error: &str,
        attempts: u32,
        next_attempt_at: i64,
    ) -> Result<bool> {
        let pool = &self.pool;
        let now = now_millis();

        let result = execute_with_retry("mark_failed", || async {
            sqlx::query(
                r#"
                UPDATE sync_queue
                SET status = 'failed', attempts = ?, last_error = ?, next_attempt_at = ?, updated_at = ?
                WHERE sequence = ? AND status = 'in_flight'
                "#,
            )
            .bind(i64::from(attempts))
            .bind(error)
            .bind(next_attempt_at)
            .bind(now)
            .bind(sequence)
            .execute(pool)
            .await
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `in_flight -> abandoned`, cascading to dependents parked behind it.
    pub async fn mark_abandoned(&self, sequence: i64, reason: &str, attempts: u32) -> Result<Abandonment> {
        let now = now_millis();
        Ok(execute_with_retry("mark_abandoned", || {
            self.mark_abandoned_tx(sequence, reason, attempts, now)
        })
        .await?)
    }

    async fn mark_abandoned_tx(
        &self,
        sequence: i64,
        reason: &str,
        attempts: u32,
        now: i64,
    ) -> sqlx::Result<Abandonment> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'abandoned', attempts = ?, last_error = ?, updated_at = ?,
                next_attempt_at = NULL, parked_on_table = NULL, parked_on_record = NULL
            WHERE sequence = ? AND status = 'in_flight'
            "#,
        )
        .bind(i64::from(attempts))
        .bind(reason)
        .bind(now)
        .bind(sequence)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(Abandonment::default());
        }

        sqlx::query("DELETE FROM sync_queue_dependencies WHERE dependent_sequence = ?")
            .bind(sequence)
            .execute(&mut *tx)
            .await?;

        let (table, record_id, operation): (String, String, String) =
            sqlx::query_as("SELECT table_name, record_id, operation FROM sync_queue WHERE sequence = ?")
                .bind(sequence)
                .fetch_one(&mut *tx)
                .await?;

        let mut cascaded = Vec::new();
        if operation == Operation::Insert.as_str() {
            let parent = RecordKey::new(table, record_id);
            if parent_state(&mut tx, &parent).await? == ParentState::Abandoned {
                cascaded = abandon_dependents(&mut tx, parent, now).await?;
            }
        }

        tx.commit().await?;
        Ok(Abandonment {
            transitioned: true,
            cascaded,
        })
    }

    /// Park a claimed item behind `parent`.
    pub async fn park(&self, sequence: i64, parent: &RecordKey) -> Result<ParkOutcome> {
        let now = now_millis();
        Ok(execute_with_retry("park", || self.park_tx(sequence, parent, now)).await?)
    }

    async fn park_tx(&self, sequence: i64, parent: &RecordKey, now: i64) -> sqlx::Result<ParkOutcome> {
        let mut tx = self.pool.begin().await?;

        // Write first so the parent check runs under the write lock.
        let updated = sqlx::query(
            r#"
            UPDATE sync_queue SET parked_on_table = ?, parked_on_record = ?, updated_at = ?
            WHERE sequence = ? AND status = 'in_flight' AND parked_on_table IS NULL
            "#,
        )
        .bind(&parent.table)
        .bind(&parent.record_id)
        .bind(now)
        .bind(sequence)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ParkOutcome::Lost);
        }

        match parent_state(&mut tx, parent).await? {
            ParentState::Resolved => {
                tx.rollback().await?;
                Ok(ParkOutcome::Resolved)
            }
            ParentState::Abandoned => {
                tx.rollback().await?;
                Ok(ParkOutcome::ParentAbandoned)
            }
            ParentState::Unresolved => {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO sync_queue_dependencies
                        (parent_table, parent_record_id, dependent_sequence, created_at)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(&parent.table)
                .bind(&parent.record_id)
                .bind(sequence)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(ParkOutcome::Parked)
            }
        }
    }

    /// `failed -> pending` once the backoff deadline has passed.
    pub async fn requeue_failed(&self, sequence: i64) -> Result<bool> {
        let pool = &self.pool;
        let now = now_millis();

        let result = execute_with_retry("requeue_failed", || async {
            sqlx::query(
                r#"
                UPDATE sync_queue SET status = 'pending', updated_at = ?
                WHERE sequence = ? AND status = 'failed'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
                "#,
            )
            .bind(now)
            .bind(sequence)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Bulk `failed -> pending` for every item whose backoff has elapsed.
    pub async fn promote_due_retries(&self) -> Result<u64> {
        let pool = &self.pool;
        let now = now_millis();

        let result = execute_with_retry("promote_due_retries", || async {
            sqlx::query(
                r#"
                UPDATE sync_queue SET status = 'pending', updated_at = ?
                WHERE status = 'failed' AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
                "#,
            )
            .bind(now)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        Ok(result.rows_affected())
    }

    /// Operator tool: `abandoned -> pending` with a fresh retry budget.
    pub async fn requeue_abandoned(&self, sequence: i64) -> Result<bool> {
        let pool = &self.pool;
        let now = now_millis();

        let result = execute_with_retry("requeue_abandoned", || async {
            sqlx::query(
                r#"
                UPDATE sync_queue
                SET status = 'pending', attempts = 0, last_error = NULL,
                    next_attempt_at = NULL, updated_at = ?
                WHERE sequence = ? AND status = 'abandoned'
                "#,
            )
            .bind(now)
            .bind(sequence)
            .execute(pool)
            .await
        })
        .await?;

        let requeued = result.rows_affected() == 1;
        if requeued {
            info!(sequence, "Abandoned item requeued by operator");
        }
        Ok(requeued)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Return items claimed by a crashed worker to `pending`. Parked items stay.
    pub async fn recover_in_flight(&self) -> Result<u64> {
        let pool = &self.pool;
        let now = now_millis();

        let result = execute_with_retry("recover_in_flight", || async {
            sqlx::query(
                r#"
                UPDATE sync_queue SET status = 'pending', updated_at = ?
                WHERE status = 'in_flight' AND parked_on_table IS NULL
                "#,
            )
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        Ok(result.rows_affected())
    }

    /// Settle parked items whose parent resolved (or was abandoned) while we
    /// were not looking.
    pub async fn reconcile_dependencies(&self) -> Result<DependencyReport> {
        let parents: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT parent_table, parent_record_id FROM sync_queue_dependencies",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut report = DependencyReport::default();
        for (table, record_id) in parents {
            let parent = RecordKey::new(table, record_id);
            let now = now_millis();
            let (released, abandoned) =
                execute_with_retry("reconcile_dependencies", || self.settle_parent_tx(&parent, now))
                    .await?;
            report.released.extend(released);
            report.abandoned.extend(abandoned);
        }

        Ok(report)
    }

    async fn settle_parent_tx(&self, parent: &RecordKey, now: i64) -> sqlx::Result<(Vec<i64>, Vec<i64>)> {
        let mut tx = self.pool.begin().await?;
        let settled = match parent_state(&mut tx, parent).await? {
            ParentState::Resolved => (release_dependents(&mut tx, parent, now).await?, Vec::new()),
            ParentState::Abandoned => (Vec::new(), abandon_dependents(&mut tx, parent.clone(), now).await?),
            ParentState::Unresolved => (Vec::new(), Vec::new()),
        };
        tx.commit().await?;
        Ok(settled)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Sync queue store closed");
    }
}

async fn parent_state(conn: &mut SqliteConnection, parent: &RecordKey) -> sqlx::Result<ParentState> {
    let status: Option<String> = sqlx::query_scalar(
        r#"
        SELECT status FROM sync_queue
        WHERE table_name = ? AND record_id = ? AND operation = 'INSERT'
        ORDER BY sequence DESC
        LIMIT 1
        "#,
    )
    .bind(&parent.table)
    .bind(&parent.record_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(ParentState::from_latest_insert(status.as_deref()))
}

async fn release_dependents(
    conn: &mut SqliteConnection,
    parent: &RecordKey,
    now: i64,
) -> sqlx::Result<Vec<i64>> {
    let dependents: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT dependent_sequence FROM sync_queue_dependencies
        WHERE parent_table = ? AND parent_record_id = ?
        ORDER BY dependent_sequence
        "#,
    )
    .bind(&parent.table)
    .bind(&parent.record_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut released = Vec::with_capacity(dependents.len());
    for sequence in dependents {
        let updated = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'pending', parked_on_table = NULL, parked_on_record = NULL, updated_at = ?
            WHERE sequence = ? AND status = 'in_flight'
              AND parked_on_table = ? AND parked_on_record = ?
            "#,
        )
        .bind(now)
        .bind(sequence)
        .bind(&parent.table)
        .bind(&parent.record_id)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 1 {
            released.push(sequence);
        }
    }

    sqlx::query("DELETE FROM sync_queue_dependencies WHERE parent_table = ? AND parent_record_id = ?")
        .bind(&parent.table)
        .bind(&parent.record_id)
        .execute(&mut *conn)
        .await?;

    Ok(released)
}

/// Abandon everything parked behind `parent`, transitively through abandoned
/// INSERT dependents.
async fn abandon_dependents(
    conn: &mut SqliteConnection,
    parent: RecordKey,
    now: i64,
) -> sqlx::Result<Vec<i64>> {
    let mut abandoned = Vec::new();
    let mut worklist = vec![parent];

    while let Some(parent) = worklist.pop() {
        let dependents: Vec<(i64, String, String, String)> = sqlx::query_as(
            r#"
            SELECT q.sequence, q.table_name, q.record_id, q.operation
            FROM sync_queue_dependencies d
            JOIN sync_queue q ON q.sequence = d.dependent_sequence
            WHERE d.parent_table = ? AND d.parent_record_id = ?
            ORDER BY q.sequence
            "#,
        )
        .bind(&parent.table)
        .bind(&parent.record_id)
        .fetch_all(&mut *conn)
        .await?;

        let reason = format!("parent abandoned: {}", parent);
        for (sequence, table, record_id, operation) in dependents {
            let updated = sqlx::query(
                r#"
                UPDATE sync_queue
                SET status = 'abandoned', last_error = ?, updated_at = ?,
                    parked_on_table = NULL, parked_on_record = NULL
                WHERE sequence = ? AND status = 'in_flight'
                  AND parked_on_table = ? AND parked_on_record = ?
                "#,
            )
            .bind(&reason)
            .bind(now)
            .bind(sequence)
            .bind(&parent.table)
            .bind(&parent.record_id)
            .execute(&mut *conn)
            .await?;

            if updated.rows_affected() == 1 {
                abandoned.push(sequence);
                if operation == Operation::Insert.as_str() {
                    worklist.push(RecordKey::new(table, record_id));
                }
            }
        }

        sqlx::query("DELETE FROM sync_queue_dependencies WHERE parent_table = ? AND parent_record_id = ?")
            .bind(&parent.table)
            .bind(&parent.record_id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(abandoned)
}
