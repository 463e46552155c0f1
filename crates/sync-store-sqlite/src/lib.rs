#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sync-store-sqlite** – SQLite-backed [`EventStore`] driver.
//!
//! Each store is a single SQLite table named by [`partition_name`], holding
//! the schema described in `spec.md` §6.4: a dense `seq_num` primary key,
//! `parent_seq_num`, `name`, a genuinely structured `args` column (stored as
//! JSON text, parsed back into `serde_json::Value` on read — never
//! stringified-then-stringified-again), `created_at`, `client_id`, and
//! `session_id`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;

use sync_store_core::{partition_name, EventStore, StorageError, StorageResult, StoredEvent};
use sync_wire::EventEncoded;

/// A persistent [`EventStore`] backed by a SQLite database.
///
/// One physical table per store, created on demand by `ensure_store`. All
/// writes for a single `append_events` call happen inside one transaction,
/// satisfying the batch-atomicity requirement in `spec.md` §4.1.
#[derive(Debug)]
pub struct SqliteEventStore {
    pool: SqlitePool,
    format_version: u32,
}

impl SqliteEventStore {
    /// Open or create a SQLite database at `path`.
    pub async fn open<P: AsRef<Path>>(path: P, format_version: u32) -> StorageResult<Self> {
        let database_url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&database_url)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            pool,
            format_version,
        })
    }

    /// Open an in-memory SQLite database — used by `sync-server --storage memory`
    /// style tests and by this crate's own test suite.
    pub async fn in_memory(format_version: u32) -> StorageResult<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            pool,
            format_version,
        })
    }

    fn table_name(&self, store_id: &str) -> String {
        partition_name(self.format_version, store_id)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn ensure_store(&self, store_id: &str) -> StorageResult<()> {
        let table = self.table_name(store_id);
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                seq_num INTEGER PRIMARY KEY,
                parent_seq_num INTEGER NOT NULL,
                name TEXT NOT NULL,
                args TEXT NOT NULL,
                created_at TEXT NOT NULL,
                client_id TEXT NOT NULL,
                session_id TEXT NOT NULL
            )
            "#
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_head(&self, store_id: &str) -> StorageResult<u64> {
        let table = self.table_name(store_id);
        let query = format!(r#"SELECT MAX(seq_num) as head FROM "{table}""#);
        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let head: Option<i64> = row.try_get("head").map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(head.unwrap_or(0) as u64)
    }

    async fn get_events(
        &self,
        store_id: &str,
        cursor: Option<u64>,
    ) -> StorageResult<Vec<StoredEvent>> {
        let table = self.table_name(store_id);
        let query = format!(
            r#"SELECT seq_num, parent_seq_num, name, args, created_at, client_id, session_id
               FROM "{table}" WHERE seq_num > ? ORDER BY seq_num ASC"#
        );
        let cursor = cursor.unwrap_or(0) as i64;
        let rows = sqlx::query(&query)
            .bind(cursor)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(row_to_stored_event).collect()
    }

    async fn append_events(
        &self,
        store_id: &str,
        batch: &[EventEncoded],
        created_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let table = self.table_name(store_id);
        let mut tx: Transaction<'_, Sqlite> = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let insert = format!(
            r#"INSERT INTO "{table}"
               (seq_num, parent_seq_num, name, args, created_at, client_id, session_id)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#
        );
        for event in batch {
            let args_json = serde_json::to_string(&event.args)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            sqlx::query(&insert)
                .bind(event.seq_num as i64)
                .bind(event.parent_seq_num as i64)
                .bind(&event.name)
                .bind(args_json)
                .bind(created_at.to_rfc3339())
                .bind(&event.client_id)
                .bind(&event.session_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn reset_store(&self, store_id: &str) -> StorageResult<()> {
        let table = self.table_name(store_id);
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{table}""#))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.ensure_store(store_id).await
    }
}

fn row_to_stored_event(row: sqlx::sqlite::SqliteRow) -> StorageResult<StoredEvent> {
    let seq_num: i64 = row.try_get("seq_num").map_err(|e| StorageError::Backend(e.to_string()))?;
    let parent_seq_num: i64 = row
        .try_get("parent_seq_num")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| StorageError::Backend(e.to_string()))?;
    let args_json: String = row.try_get("args").map_err(|e| StorageError::Backend(e.to_string()))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let client_id: String = row.try_get("client_id").map_err(|e| StorageError::Backend(e.to_string()))?;
    let session_id: String = row
        .try_get("session_id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    let args = serde_json::from_str(&args_json).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap());

    Ok(StoredEvent {
        event: EventEncoded {
            seq_num: seq_num as u64,
            parent_seq_num: parent_seq_num as u64,
            name,
            args,
            client_id,
            session_id,
        },
        created_at,
    })
}
