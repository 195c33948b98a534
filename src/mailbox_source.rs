//! Configuration/credential source (spec §6): the query surface returning
//! active [`Mailbox`] records at startup and on periodic refresh. Out of
//! scope per spec §1 ("only the query surface is specified") — this module
//! fixes a concrete SQLite-backed transport so the crate is runnable, the
//! same way `status_store.rs` fixes one for the Status Store Adapter.
//!
//! Grounded on the teacher's `MailDatabase` in `mail/database.rs`: same
//! `SqlitePool` + `CREATE TABLE IF NOT EXISTS` + `INSERT OR REPLACE` +
//! `Row::try_get` row-mapping shape as `status_store.rs`, applied to the
//! `accounts` table's `list_accounts`/`store_account` pair instead of
//! `mailbox_status`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::Secret;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::error::{IngestError, IngestResult};
use crate::types::{Mailbox, MailboxCredentials, MailboxId, TlsMode};

/// The persistence boundary the Scheduler's startup load and periodic
/// refresh depend on. A production deployment may re-implement this trait
/// against an HTTP-backed credential service without touching the control
/// plane (spec §6: "transport is unspecified").
#[async_trait]
pub trait MailboxSource: Send + Sync {
    /// All mailboxes with `active = true`, for the initial load and each
    /// periodic refresh (spec §3: "loaded into memory at startup and
    /// refreshed periodically").
    async fn active_mailboxes(&self) -> IngestResult<Vec<Mailbox>>;
}

pub struct SqliteMailboxSource {
    pool: SqlitePool,
}

impl SqliteMailboxSource {
    pub async fn connect(database_url: &str) -> IngestResult<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(IngestError::from)?;
        let source = Self { pool };
        source.run_migrations().await?;
        Ok(source)
    }

    async fn run_migrations(&self) -> IngestResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                active BOOLEAN NOT NULL,
                owner TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                daily_send_limit INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mailboxes_active ON mailboxes (active)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Upsert a mailbox record. Not part of the `MailboxSource` trait — spec
    /// §6 specifies only the read surface the fleet depends on — but needed
    /// to seed the table the rest of this adapter reads from.
    pub async fn upsert(&self, mailbox: &Mailbox) -> IngestResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO mailboxes
            (id, address, host, port, username, password, active, owner,
             created_at, updated_at, daily_send_limit)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(mailbox.id.to_string())
        .bind(&mailbox.address)
        .bind(&mailbox.host)
        .bind(mailbox.port as i64)
        .bind(&mailbox.credentials.username)
        .bind(secrecy::ExposeSecret::expose_secret(&mailbox.credentials.password))
        .bind(mailbox.active)
        .bind(&mailbox.owner)
        .bind(mailbox.created_at.timestamp())
        .bind(mailbox.updated_at.timestamp())
        .bind(mailbox.daily_send_limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_mailbox(row: SqliteRow) -> IngestResult<Mailbox> {
        let id_str: String = row.try_get("id")?;
        let id = MailboxId(
            uuid::Uuid::parse_str(&id_str)
                .map_err(|e| IngestError::other(format!("corrupt mailbox id {id_str:?}: {e}")))?,
        );
        let port: i64 = row.try_get("port")?;
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;
        let daily_send_limit: i64 = row.try_get("daily_send_limit")?;

        Ok(Mailbox {
            id,
            address: row.try_get("address")?,
            host: row.try_get("host")?,
            port: port as u16,
            tls_mode: TlsMode::from_port(port as u16),
            credentials: MailboxCredentials {
                username: row.try_get("username")?,
                password: Secret::new(row.try_get("password")?),
            },
            active: row.try_get("active")?,
            owner: row.try_get("owner")?,
            created_at: timestamp(created_at),
            updated_at: timestamp(updated_at),
            daily_send_limit: daily_send_limit as u32,
        })
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl MailboxSource for SqliteMailboxSource {
    async fn active_mailboxes(&self) -> IngestResult<Vec<Mailbox>> {
        let rows = sqlx::query("SELECT * FROM mailboxes WHERE active = 1 ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_mailbox).collect()
    }
}

/// In-memory fake for tests and for `S1`/`S3`/`S5`-style scenario fixtures.
#[derive(Default)]
pub struct InMemoryMailboxSource {
    mailboxes: tokio::sync::Mutex<Vec<Mailbox>>,
}

impl InMemoryMailboxSource {
    pub fn new(mailboxes: Vec<Mailbox>) -> Self {
        Self {
            mailboxes: tokio::sync::Mutex::new(mailboxes),
        }
    }

    pub async fn set(&self, mailboxes: Vec<Mailbox>) {
        *self.mailboxes.lock().await = mailboxes;
    }
}

#[async_trait]
impl MailboxSource for InMemoryMailboxSource {
    async fn active_mailboxes(&self) -> IngestResult<Vec<Mailbox>> {
        Ok(self
            .mailboxes
            .lock()
            .await
            .iter()
            .filter(|m| m.active)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TlsMode;
    use secrecy::Secret;

    fn mailbox(active: bool) -> Mailbox {
        Mailbox {
            id: MailboxId::new(),
            address: "user@example.com".into(),
            host: "imap.example.com".into(),
            port: 993,
            tls_mode: TlsMode::Implicit,
            credentials: MailboxCredentials {
                username: "user@example.com".into(),
                password: Secret::new("pw".into()),
            },
            active,
            owner: "team-a".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            daily_send_limit: 10,
        }
    }

    #[tokio::test]
    async fn in_memory_source_filters_inactive() {
        let source = InMemoryMailboxSource::new(vec![mailbox(true), mailbox(false)]);
        let active = source.active_mailboxes().await.unwrap();
        assert_eq!(active.len(), 1);
    }

    /// Exercises the real `sqlx`-backed adapter end to end against a
    /// throwaway on-disk database, rather than only the in-memory fake.
    #[tokio::test]
    async fn sqlite_source_round_trips_and_filters_inactive() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("mailboxes.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let source = SqliteMailboxSource::connect(&url).await.unwrap();

        let active_mailbox = mailbox(true);
        let inactive_mailbox = mailbox(false);
        source.upsert(&active_mailbox).await.unwrap();
        source.upsert(&inactive_mailbox).await.unwrap();

        let active = source.active_mailboxes().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, active_mailbox.id);
        assert_eq!(active[0].credentials.username, active_mailbox.credentials.username);
    }
}
