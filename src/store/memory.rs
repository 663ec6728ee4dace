//! Process-local stores backed by mutex-guarded maps.

use super::{Reservation, SessionStore, UsageStore};
use crate::error::PipelineError;
use crate::session::{ProcessingSession, UploadRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, PipelineError> {
    m.lock()
        .map_err(|_| PipelineError::Storage("in-memory store lock poisoned".into()))
}

/// Usage counters keyed by `(scope, date_key)`.
///
/// Date keys sort lexically (`%Y-%m-%d`), so the first reservation of a new
/// day drops every older counter.
#[derive(Default)]
pub struct MemoryUsageStore {
    counters: Mutex<Counters>,
}

#[derive(Default)]
struct Counters {
    newest_day: String,
    by_scope: HashMap<(String, String), u32>,
}

impl Counters {
    fn prune_before(&mut self, date_key: &str) -> usize {
        let before = self.by_scope.len();
        self.by_scope.retain(|(_, day), _| day.as_str() >= date_key);
        before - self.by_scope.len()
    }
}

impl MemoryUsageStore {
    /// Number of `(scope, day)` counters held.
    pub fn len(&self) -> usize {
        self.counters.lock().map(|c| c.by_scope.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn reserve(
        &self,
        scope: &str,
        date_key: &str,
        limit: u32,
    ) -> Result<Reservation, PipelineError> {
        // Read, compare and increment under one guard.
        let mut counters = lock(&self.counters)?;
        if date_key > counters.newest_day.as_str() {
            counters.newest_day = date_key.to_string();
            counters.prune_before(date_key);
        }
        let count = counters
            .by_scope
            .entry((scope.to_string(), date_key.to_string()))
            .or_insert(0);
        if *count >= limit {
            return Ok(Reservation {
                allowed: false,
                count: *count,
            });
        }
        *count += 1;
        Ok(Reservation {
            allowed: true,
            count: *count,
        })
    }

    async fn current(&self, scope: &str, date_key: &str) -> Result<u32, PipelineError> {
        let counters = lock(&self.counters)?;
        Ok(counters
            .by_scope
            .get(&(scope.to_string(), date_key.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn prune_before(&self, date_key: &str) -> Result<usize, PipelineError> {
        Ok(lock(&self.counters)?.prune_before(date_key))
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, ProcessingSession>>,
    uploads: Mutex<HashMap<String, UploadRecord>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &ProcessingSession) -> Result<(), PipelineError> {
        let mut sessions = lock(&self.sessions)?;
        if sessions.contains_key(&session.id) {
            return Err(PipelineError::Storage(format!(
                "session '{}' already exists",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ProcessingSession>, PipelineError> {
        Ok(lock(&self.sessions)?.get(id).cloned())
    }

    async fn update(&self, session: &ProcessingSession) -> Result<u64, PipelineError> {
        let mut sessions = lock(&self.sessions)?;
        let stored = sessions
            .get_mut(&session.id)
            .ok_or_else(|| PipelineError::SessionNotFound {
                id: session.id.clone(),
            })?;
        if stored.version != session.version {
            return Err(PipelineError::Conflict {
                id: session.id.clone(),
                expected: session.version,
                found: stored.version,
            });
        }
        let mut next = session.clone();
        next.version = session.version + 1;
        *stored = next;
        Ok(session.version + 1)
    }

    async fn delete(&self, id: &str) -> Result<bool, PipelineError> {
        Ok(lock(&self.sessions)?.remove(id).is_some())
    }

    async fn put_upload_record(&self, record: &UploadRecord) -> Result<(), PipelineError> {
        lock(&self.uploads)?.insert(record.object_path.clone(), record.clone());
        Ok(())
    }

    async fn delete_upload_record(&self, object_path: &str) -> Result<bool, PipelineError> {
        Ok(lock(&self.uploads)?.remove(object_path).is_some())
    }

    async fn expired_upload_records(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UploadRecord>, PipelineError> {
        let mut expired: Vec<UploadRecord> = lock(&self.uploads)?
            .values()
            .filter(|r| r.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }

    async fn sessions_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, PipelineError> {
        Ok(lock(&self.sessions)?
            .values()
            .filter(|s| s.created_at < cutoff)
            .map(|s| s.id.clone())
            .collect())
    }
}
