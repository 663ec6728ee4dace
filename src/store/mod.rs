//! Persistence seams: usage counters, sessions, and upload records.
//!
//! Every store is an injected trait object with two implementations:
//!
//! * [`sqlite`] — durable and transactional; safe across processes on one host.
//! * [`memory`] — process-local maps for tests and offline single-instance use.
//!
//! The implementation is chosen once, at construction, through
//! [`StoreBackend`]. Nothing in the crate reaches for a global map.

pub mod memory;
pub mod sqlite;

use crate::error::PipelineError;
use crate::session::{ProcessingSession, UploadRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub use memory::{MemorySessionStore, MemoryUsageStore};
pub use sqlite::SqliteStore;

/// Outcome of a reserve-if-under-limit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub allowed: bool,
    /// Counter value after the call.
    pub count: u32,
}

/// Per-scope daily usage counters.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Atomically increment the `(scope, date_key)` counter if it is below
    /// `limit`. Two concurrent calls at the boundary never both succeed.
    async fn reserve(&self, scope: &str, date_key: &str, limit: u32)
        -> Result<Reservation, PipelineError>;

    /// Current counter value (0 when absent).
    async fn current(&self, scope: &str, date_key: &str) -> Result<u32, PipelineError>;

    /// Drop counters for days before `date_key`. Returns how many went.
    async fn prune_before(&self, date_key: &str) -> Result<usize, PipelineError>;
}

/// Session metadata and upload records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &ProcessingSession) -> Result<(), PipelineError>;

    async fn get(&self, id: &str) -> Result<Option<ProcessingSession>, PipelineError>;

    /// Compare-and-set save. Succeeds only when the stored version equals
    /// `session.version`; returns the new version.
    async fn update(&self, session: &ProcessingSession) -> Result<u64, PipelineError>;

    /// Returns `false` when the session did not exist.
    async fn delete(&self, id: &str) -> Result<bool, PipelineError>;

    async fn put_upload_record(&self, record: &UploadRecord) -> Result<(), PipelineError>;

    /// Returns `false` when the record did not exist.
    async fn delete_upload_record(&self, object_path: &str) -> Result<bool, PipelineError>;

    async fn expired_upload_records(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UploadRecord>, PipelineError>;

    async fn sessions_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, PipelineError>;
}

/// Which store implementation to construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local maps. Not suitable for multi-instance deployment.
    Memory,
    /// SQLite database at the given path.
    Sqlite(PathBuf),
}

/// The pair of stores a service runs on.
#[derive(Clone)]
pub struct Stores {
    pub usage: Arc<dyn UsageStore>,
    pub sessions: Arc<dyn SessionStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            usage: Arc::new(MemoryUsageStore::default()),
            sessions: Arc::new(MemorySessionStore::default()),
        }
    }

    /// Open the requested backend, failing if it is unavailable.
    pub fn open(backend: &StoreBackend) -> Result<Self, PipelineError> {
        match backend {
            StoreBackend::Memory => Ok(Self::memory()),
            StoreBackend::Sqlite(path) => {
                let store = Arc::new(SqliteStore::open(path)?);
                info!("Using SQLite store at {}", path.display());
                Ok(Self {
                    usage: store.clone(),
                    sessions: store,
                })
            }
        }
    }

    /// Open the requested backend, falling back to process-local stores when
    /// the durable one cannot be opened.
    pub fn open_or_memory(backend: &StoreBackend) -> Self {
        match Self::open(backend) {
            Ok(stores) => stores,
            Err(e) => {
                warn!("Durable store unavailable ({e}); falling back to in-memory stores");
                Self::memory()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unopenable_sqlite_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file.
        let backend = StoreBackend::Sqlite(dir.path().to_path_buf());
        assert!(Stores::open(&backend).is_err());
        let _stores = Stores::open_or_memory(&backend);
    }
}
