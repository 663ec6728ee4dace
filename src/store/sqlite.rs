//! SQLite-backed usage counters and session store.
//!
//! ## Why spawn_blocking?
//!
//! `rusqlite` is synchronous. Every query runs inside
//! `tokio::task::spawn_blocking` so a slow disk never stalls the Tokio worker
//! threads that are driving upstream inference calls.
//!
//! ## Atomicity
//!
//! Reservations and versioned session saves open an `IMMEDIATE` transaction:
//! the write lock is taken before the read, so two processes sharing the
//! database file cannot both read "2 of 3" and both increment.

use super::{Reservation, SessionStore, UsageStore};
use crate::error::PipelineError;
use crate::session::{ProcessingSession, UploadRecord};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS usage_counters (
    scope TEXT NOT NULL,
    date_key TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (scope, date_key)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS upload_records (
    object_path TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_records_expires ON upload_records(expires_at);
CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at);
";

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Storage(format!("sqlite: {e}"))
    }
}

/// One connection shared by both store traits.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, PipelineError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PipelineError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, PipelineError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| PipelineError::Storage("sqlite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("sqlite task panicked: {e}")))?
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn decode_session(body: &str) -> Result<ProcessingSession, PipelineError> {
    serde_json::from_str(body)
        .map_err(|e| PipelineError::Storage(format!("corrupt session record: {e}")))
}

fn encode_session(session: &ProcessingSession) -> Result<String, PipelineError> {
    serde_json::to_string(session)
        .map_err(|e| PipelineError::Internal(format!("session serialisation: {e}")))
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn reserve(
        &self,
        scope: &str,
        date_key: &str,
        limit: u32,
    ) -> Result<Reservation, PipelineError> {
        let scope = scope.to_string();
        let date_key = date_key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let count: u32 = tx
                .query_row(
                    "SELECT count FROM usage_counters WHERE scope = ?1 AND date_key = ?2",
                    params![scope, date_key],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);

            if count >= limit {
                tx.commit()?;
                return Ok(Reservation {
                    allowed: false,
                    count,
                });
            }

            tx.execute(
                "INSERT INTO usage_counters (scope, date_key, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(scope, date_key) DO UPDATE SET count = count + 1",
                params![scope, date_key],
            )?;
            tx.commit()?;
            debug!("Reserved usage unit {}/{} for {}", count + 1, limit, scope);
            Ok(Reservation {
                allowed: true,
                count: count + 1,
            })
        })
        .await
    }

    async fn current(&self, scope: &str, date_key: &str) -> Result<u32, PipelineError> {
        let scope = scope.to_string();
        let date_key = date_key.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT count FROM usage_counters WHERE scope = ?1 AND date_key = ?2",
                    params![scope, date_key],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0))
        })
        .await
    }

    async fn prune_before(&self, date_key: &str) -> Result<usize, PipelineError> {
        let date_key = date_key.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM usage_counters WHERE date_key < ?1",
                params![date_key],
            )?)
        })
        .await
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert(&self, session: &ProcessingSession) -> Result<(), PipelineError> {
        let body = encode_session(session)?;
        let id = session.id.clone();
        let version = session.version as i64;
        let created = to_millis(session.created_at);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, version, created_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![id, version, created, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<ProcessingSession>, PipelineError> {
        let id = id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM sessions WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        body.as_deref().map(decode_session).transpose()
    }

    async fn update(&self, session: &ProcessingSession) -> Result<u64, PipelineError> {
        let expected = session.version;
        let mut next = session.clone();
        next.version = expected + 1;
        let body = encode_session(&next)?;
        let id = session.id.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let found: Option<i64> = tx
                .query_row(
                    "SELECT version FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match found {
                None => return Err(PipelineError::SessionNotFound { id }),
                Some(v) if v as u64 != expected => {
                    return Err(PipelineError::Conflict {
                        id,
                        expected,
                        found: v as u64,
                    })
                }
                Some(_) => {}
            }
            tx.execute(
                "UPDATE sessions SET version = ?2, body = ?3 WHERE id = ?1",
                params![id, (expected + 1) as i64, body],
            )?;
            tx.commit()?;
            Ok(expected + 1)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, PipelineError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])? > 0)
        })
        .await
    }

    async fn put_upload_record(&self, record: &UploadRecord) -> Result<(), PipelineError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO upload_records (object_path, session_id, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(object_path) DO UPDATE SET session_id = ?2, expires_at = ?3",
                params![
                    record.object_path,
                    record.session_id,
                    to_millis(record.expires_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_upload_record(&self, object_path: &str) -> Result<bool, PipelineError> {
        let path = object_path.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM upload_records WHERE object_path = ?1",
                params![path],
            )? > 0)
        })
        .await
    }

    async fn expired_upload_records(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UploadRecord>, PipelineError> {
        let now = to_millis(now);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT object_path, session_id, expires_at FROM upload_records
                 WHERE expires_at <= ?1 ORDER BY expires_at",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok(UploadRecord {
                    object_path: row.get(0)?,
                    session_id: row.get(1)?,
                    expires_at: from_millis(row.get(2)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn sessions_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, PipelineError> {
        let cutoff = to_millis(cutoff);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM sessions WHERE created_at < ?1")?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
        .await
    }
}
