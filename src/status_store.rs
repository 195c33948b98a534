//! Status Store Adapter (X2): durable per-mailbox connection lifecycle state
//! and the ingestion watermark, backed by SQLite via `sqlx`.
//!
//! Grounded on the teacher's `MailDatabase` in `mail/database.rs`: a
//! `SqlitePool` wrapped in a thin struct, `run_migrations()` issuing
//! `CREATE TABLE IF NOT EXISTS`, `INSERT OR REPLACE` upserts, and a
//! `row_to_*` mapping helper built on `sqlx::Row::try_get`. The watermark
//! (`last_processed_uid`) lives on the same status record row rather than a
//! separate table — there is exactly one row per mailbox and both pieces of
//! state change together on every successful poll (spec §5).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::error::{IngestError, IngestResult};
use crate::types::{MailboxId, MailboxState, StatusRecord};

/// One of the monotonically increasing counters carried on a status record
/// (spec §4.5's "increment helpers for counters"), applied in a single
/// read-modify-write against the stored row rather than requiring the caller
/// to fetch a whole `StatusRecord` first.
#[derive(Debug, Clone, Copy)]
pub enum StatusCounter {
    Attempt,
    Success,
    Failure,
    MessagesProcessed(u64),
}

impl StatusCounter {
    fn column(&self) -> &'static str {
        match self {
            StatusCounter::Attempt => "attempts",
            StatusCounter::Success => "successes",
            StatusCounter::Failure => "failures",
            StatusCounter::MessagesProcessed(_) => "messages_processed",
        }
    }

    fn delta(&self) -> u64 {
        match self {
            StatusCounter::MessagesProcessed(n) => *n,
            _ => 1,
        }
    }
}

/// The persistence boundary the rest of the fleet depends on, so tests can
/// substitute an in-memory fake instead of standing up SQLite.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn upsert(&self, record: &StatusRecord) -> IngestResult<()>;
    async fn get(&self, mailbox_id: MailboxId) -> IngestResult<Option<StatusRecord>>;
    /// Batched form of `get`, for callers joining a set of active mailboxes
    /// against their current status in one round trip instead of N+1
    /// per-mailbox queries (spec §4.5).
    async fn get_many(&self, mailbox_ids: &[MailboxId]) -> IngestResult<HashMap<MailboxId, StatusRecord>>;
    async fn needing_reconnection(&self) -> IngestResult<Vec<StatusRecord>>;
    async fn advance_watermark(&self, mailbox_id: MailboxId, uid: u32) -> IngestResult<()>;
    async fn increment(&self, mailbox_id: MailboxId, counter: StatusCounter) -> IngestResult<()>;
    /// Record a connection-lifecycle state transition (spec §4.1: "a created
    /// session starts in state `connected`; it transitions to `idle`... to
    /// `error` on event-loop failure, and to `disconnected` on close").
    /// `error_message` is only meaningful (and stored) for `MailboxState::Error`.
    /// Leaves every other column — counters, watermark — untouched, so this
    /// never races the increment/advance_watermark helpers for the same row.
    async fn set_state(
        &self,
        mailbox_id: MailboxId,
        state: MailboxState,
        error_message: Option<String>,
    ) -> IngestResult<()>;
}

pub struct SqliteStatusStore {
    pool: SqlitePool,
    /// Per-mailbox lock serializing `upsert`/`advance_watermark`/`increment`
    /// so concurrent writers for the same mailbox never interleave (spec
    /// §4.5: "a single in-flight upsert per mailbox id at a time").
    mailbox_locks: Mutex<HashMap<MailboxId, Arc<Mutex<()>>>>,
}

impl SqliteStatusStore {
    pub async fn connect(database_url: &str) -> IngestResult<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(IngestError::from)?;
        let store = Self {
            pool,
            mailbox_locks: Mutex::new(HashMap::new()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn mailbox_lock(&self, mailbox_id: MailboxId) -> Arc<Mutex<()>> {
        let mut locks = self.mailbox_locks.lock().await;
        locks.entry(mailbox_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn run_migrations(&self) -> IngestResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mailbox_status (
                mailbox_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                last_connected INTEGER,
                last_disconnected INTEGER,
                last_error INTEGER,
                last_error_message TEXT,
                attempts INTEGER NOT NULL,
                successes INTEGER NOT NULL,
                failures INTEGER NOT NULL,
                messages_processed INTEGER NOT NULL,
                next_reconnect INTEGER,
                active BOOLEAN NOT NULL,
                last_processed_uid INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mailbox_status_state ON mailbox_status (state)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(row: SqliteRow) -> IngestResult<StatusRecord> {
        let mailbox_id_str: String = row.try_get("mailbox_id")?;
        let mailbox_id = MailboxId(
            uuid::Uuid::parse_str(&mailbox_id_str)
                .map_err(|e| IngestError::other(format!("corrupt mailbox_id in status store: {e}")))?,
        );

        let state = match row.try_get::<String, _>("state")?.as_str() {
            "connecting" => MailboxState::Connecting,
            "connected" => MailboxState::Connected,
            "idle" => MailboxState::Idle,
            "disconnected" => MailboxState::Disconnected,
            "error" => MailboxState::Error,
            "reconnecting" => MailboxState::Reconnecting,
            other => {
                return Err(IngestError::other(format!(
                    "unknown mailbox state {other:?} in status store"
                )))
            }
        };

        Ok(StatusRecord {
            mailbox_id,
            state,
            last_connected: timestamp_col(&row, "last_connected")?,
            last_disconnected: timestamp_col(&row, "last_disconnected")?,
            last_error: timestamp_col(&row, "last_error")?,
            last_error_message: row.try_get("last_error_message")?,
            attempts: row.try_get::<i64, _>("attempts")? as u64,
            successes: row.try_get::<i64, _>("successes")? as u64,
            failures: row.try_get::<i64, _>("failures")? as u64,
            messages_processed: row.try_get::<i64, _>("messages_processed")? as u64,
            next_reconnect: timestamp_col(&row, "next_reconnect")?,
            active: row.try_get("active")?,
            last_processed_uid: row
                .try_get::<Option<i64>, _>("last_processed_uid")?
                .map(|v| v as u32),
        })
    }
}

fn timestamp_col(row: &SqliteRow, col: &str) -> IngestResult<Option<DateTime<Utc>>> {
    Ok(row
        .try_get::<Option<i64>, _>(col)?
        .map(|ts| Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)))
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn upsert(&self, record: &StatusRecord) -> IngestResult<()> {
        let lock = self.mailbox_lock(record.mailbox_id).await;
        let _guard = lock.lock().await;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO mailbox_status
            (mailbox_id, state, last_connected, last_disconnected, last_error,
             last_error_message, attempts, successes, failures, messages_processed,
             next_reconnect, active, last_processed_uid)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.mailbox_id.to_string())
        .bind(record.state.as_str())
        .bind(record.last_connected.map(|d| d.timestamp()))
        .bind(record.last_disconnected.map(|d| d.timestamp()))
        .bind(record.last_error.map(|d| d.timestamp()))
        .bind(&record.last_error_message)
        .bind(record.attempts as i64)
        .bind(record.successes as i64)
        .bind(record.failures as i64)
        .bind(record.messages_processed as i64)
        .bind(record.next_reconnect.map(|d| d.timestamp()))
        .bind(record.active)
        .bind(record.last_processed_uid.map(|v| v as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, mailbox_id: MailboxId) -> IngestResult<Option<StatusRecord>> {
        let row = sqlx::query("SELECT * FROM mailbox_status WHERE mailbox_id = ?")
            .bind(mailbox_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_record).transpose()
    }

    async fn get_many(&self, mailbox_ids: &[MailboxId]) -> IngestResult<HashMap<MailboxId, StatusRecord>> {
        if mailbox_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut builder = sqlx::QueryBuilder::new("SELECT * FROM mailbox_status WHERE mailbox_id IN (");
        let mut separated = builder.separated(", ");
        for id in mailbox_ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(Self::row_to_record)
            .map(|r| r.map(|record| (record.mailbox_id, record)))
            .collect()
    }

    async fn needing_reconnection(&self) -> IngestResult<Vec<StatusRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM mailbox_status WHERE active = 1 AND state IN ('disconnected', 'error', 'reconnecting')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_record).collect()
    }

    /// Advance the watermark without disturbing the rest of the row; retried
    /// once as a plain `UPDATE` if the row doesn't exist yet (a mailbox's
    /// very first poll may race the initial `upsert`).
    async fn advance_watermark(&self, mailbox_id: MailboxId, uid: u32) -> IngestResult<()> {
        let lock = self.mailbox_lock(mailbox_id).await;
        let _guard = lock.lock().await;

        let result = sqlx::query(
            "UPDATE mailbox_status SET last_processed_uid = ? WHERE mailbox_id = ?",
        )
        .bind(uid as i64)
        .bind(mailbox_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let mut record = StatusRecord::new(mailbox_id);
            record.last_processed_uid = Some(uid);
            drop(_guard);
            self.upsert(&record).await?;
        }
        Ok(())
    }

    /// Increment one counter column in place, retried as an insert of a
    /// fresh record (with the increment already applied) if the row doesn't
    /// exist yet — mirrors `advance_watermark`'s race handling.
    async fn increment(&self, mailbox_id: MailboxId, counter: StatusCounter) -> IngestResult<()> {
        let lock = self.mailbox_lock(mailbox_id).await;
        let _guard = lock.lock().await;

        let sql = format!(
            "UPDATE mailbox_status SET {col} = {col} + ? WHERE mailbox_id = ?",
            col = counter.column()
        );
        let result = sqlx::query(&sql)
            .bind(counter.delta() as i64)
            .bind(mailbox_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let mut record = StatusRecord::new(mailbox_id);
            match counter {
                StatusCounter::Attempt => record.attempts = counter.delta(),
                StatusCounter::Success => record.successes = counter.delta(),
                StatusCounter::Failure => record.failures = counter.delta(),
                StatusCounter::MessagesProcessed(_) => record.messages_processed = counter.delta(),
            }
            drop(_guard);
            self.upsert(&record).await?;
        }
        Ok(())
    }

    async fn set_state(
        &self,
        mailbox_id: MailboxId,
        state: MailboxState,
        error_message: Option<String>,
    ) -> IngestResult<()> {
        let lock = self.mailbox_lock(mailbox_id).await;
        let _guard = lock.lock().await;

        let now = Utc::now().timestamp();
        let result = match state {
            MailboxState::Connected => {
                sqlx::query(
                    "UPDATE mailbox_status SET state = ?, last_connected = ? WHERE mailbox_id = ?",
                )
                .bind(state.as_str())
                .bind(now)
                .bind(mailbox_id.to_string())
                .execute(&self.pool)
                .await?
            }
            MailboxState::Disconnected => {
                sqlx::query(
                    "UPDATE mailbox_status SET state = ?, last_disconnected = ? WHERE mailbox_id = ?",
                )
                .bind(state.as_str())
                .bind(now)
                .bind(mailbox_id.to_string())
                .execute(&self.pool)
                .await?
            }
            MailboxState::Error => {
                sqlx::query(
                    "UPDATE mailbox_status SET state = ?, last_error = ?, last_error_message = ? WHERE mailbox_id = ?",
                )
                .bind(state.as_str())
                .bind(now)
                .bind(&error_message)
                .bind(mailbox_id.to_string())
                .execute(&self.pool)
                .await?
            }
            MailboxState::Connecting | MailboxState::Idle | MailboxState::Reconnecting => {
                sqlx::query("UPDATE mailbox_status SET state = ? WHERE mailbox_id = ?")
                    .bind(state.as_str())
                    .bind(mailbox_id.to_string())
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            let mut record = StatusRecord::new(mailbox_id);
            record.state = state;
            match state {
                MailboxState::Connected => record.last_connected = Some(Utc::now()),
                MailboxState::Disconnected => record.last_disconnected = Some(Utc::now()),
                MailboxState::Error => {
                    record.last_error = Some(Utc::now());
                    record.last_error_message = error_message;
                }
                _ => {}
            }
            drop(_guard);
            self.upsert(&record).await?;
        }
        Ok(())
    }
}

/// In-memory fake for tests (spec §8's scenario tests run without a real
/// database).
#[derive(Default)]
pub struct InMemoryStatusStore {
    records: tokio::sync::Mutex<std::collections::HashMap<MailboxId, StatusRecord>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn upsert(&self, record: &StatusRecord) -> IngestResult<()> {
        self.records
            .lock()
            .await
            .insert(record.mailbox_id, record.clone());
        Ok(())
    }

    async fn get(&self, mailbox_id: MailboxId) -> IngestResult<Option<StatusRecord>> {
        Ok(self.records.lock().await.get(&mailbox_id).cloned())
    }

    async fn get_many(&self, mailbox_ids: &[MailboxId]) -> IngestResult<HashMap<MailboxId, StatusRecord>> {
        let records = self.records.lock().await;
        Ok(mailbox_ids
            .iter()
            .filter_map(|id| records.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn needing_reconnection(&self) -> IngestResult<Vec<StatusRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.active && r.state.needs_reconnection())
            .cloned()
            .collect())
    }

    async fn advance_watermark(&self, mailbox_id: MailboxId, uid: u32) -> IngestResult<()> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(mailbox_id)
            .or_insert_with(|| StatusRecord::new(mailbox_id));
        record.last_processed_uid = Some(uid);
        Ok(())
    }

    async fn increment(&self, mailbox_id: MailboxId, counter: StatusCounter) -> IngestResult<()> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(mailbox_id)
            .or_insert_with(|| StatusRecord::new(mailbox_id));
        match counter {
            StatusCounter::Attempt => record.attempts += counter.delta(),
            StatusCounter::Success => record.successes += counter.delta(),
            StatusCounter::Failure => record.failures += counter.delta(),
            StatusCounter::MessagesProcessed(_) => record.messages_processed += counter.delta(),
        }
        Ok(())
    }

    async fn set_state(
        &self,
        mailbox_id: MailboxId,
        state: MailboxState,
        error_message: Option<String>,
    ) -> IngestResult<()> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(mailbox_id)
            .or_insert_with(|| StatusRecord::new(mailbox_id));
        record.state = state;
        match state {
            MailboxState::Connected => record.last_connected = Some(Utc::now()),
            MailboxState::Disconnected => record.last_disconnected = Some(Utc::now()),
            MailboxState::Error => {
                record.last_error = Some(Utc::now());
                record.last_error_message = error_message;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trips_watermark() {
        let store = InMemoryStatusStore::new();
        let mailbox_id = MailboxId::new();
        store.advance_watermark(mailbox_id, 42).await.unwrap();
        let record = store.get(mailbox_id).await.unwrap().unwrap();
        assert_eq!(record.last_processed_uid, Some(42));
    }

    #[tokio::test]
    async fn in_memory_store_filters_needing_reconnection() {
        let store = InMemoryStatusStore::new();
        let mut healthy = StatusRecord::new(MailboxId::new());
        healthy.state = MailboxState::Connected;
        let mut broken = StatusRecord::new(MailboxId::new());
        broken.state = MailboxState::Error;
        store.upsert(&healthy).await.unwrap();
        store.upsert(&broken).await.unwrap();

        let needing = store.needing_reconnection().await.unwrap();
        assert_eq!(needing.len(), 1);
        assert_eq!(needing[0].mailbox_id, broken.mailbox_id);
    }

    /// Exercises the real `sqlx`-backed adapter end to end against a
    /// throwaway on-disk database, rather than only the in-memory fake.
    #[tokio::test]
    async fn sqlite_store_round_trips_watermark_and_counters() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("status.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let store = SqliteStatusStore::connect(&url).await.unwrap();

        let mailbox_id = MailboxId::new();
        store.advance_watermark(mailbox_id, 7).await.unwrap();
        store.increment(mailbox_id, StatusCounter::Attempt).await.unwrap();
        store.increment(mailbox_id, StatusCounter::Success).await.unwrap();
        store
            .increment(mailbox_id, StatusCounter::MessagesProcessed(3))
            .await
            .unwrap();

        let record = store.get(mailbox_id).await.unwrap().unwrap();
        assert_eq!(record.last_processed_uid, Some(7));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.successes, 1);
        assert_eq!(record.messages_processed, 3);

        let many = store.get_many(&[mailbox_id]).await.unwrap();
        assert_eq!(many.len(), 1);
    }
}
