//! Blob storage for uploaded documents.
//!
//! Object paths are relative, `/`-separated keys such as
//! `uploads/<session-id>/invoice.pdf`. Deleting an absent object is not an
//! error: cleanup runs on several paths and may race with the sweep.

use crate::error::PipelineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, object_path: &str, bytes: Vec<u8>) -> Result<(), PipelineError>;

    /// `None` when the object does not exist.
    async fn get(&self, object_path: &str) -> Result<Option<Vec<u8>>, PipelineError>;

    /// Returns `false` when the object was already gone.
    async fn delete(&self, object_path: &str) -> Result<bool, PipelineError>;
}

/// Build the object key for a session's upload.
pub fn object_path_for(session_id: &str, file_name: &str) -> String {
    let name: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim_start_matches('.');
    let name = if name.is_empty() { "upload" } else { name };
    format!("uploads/{session_id}/{name}")
}

/// Objects stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, object_path: &str) -> Result<PathBuf, PipelineError> {
        let rel = Path::new(object_path);
        let safe = !object_path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PipelineError::Storage(format!(
                "invalid object path '{object_path}'"
            )));
        }
        Ok(self.root.join(rel))
    }
}

fn io_err(op: &str, path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::Storage(format!("{op} {}: {e}", path.display()))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, object_path: &str, bytes: Vec<u8>) -> Result<(), PipelineError> {
        let path = self.resolve(object_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("create", parent, e))?;
        }
        debug!("Writing blob {} ({} bytes)", object_path, bytes.len());
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_err("write", &path, e))
    }

    async fn get(&self, object_path: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let path = self.resolve(object_path)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read", &path, e)),
        }
    }

    async fn delete(&self, object_path: &str) -> Result<bool, PipelineError> {
        let path = self.resolve(object_path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                // Best effort: drop the per-session directory once empty.
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::remove_dir(parent).await;
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("delete", &path, e)),
        }
    }
}

/// Process-local blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, object_path: &str) -> bool {
        self.objects
            .lock()
            .map(|m| m.contains_key(object_path))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, PipelineError> {
        self.objects
            .lock()
            .map_err(|_| PipelineError::Storage("blob store lock poisoned".into()))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, object_path: &str, bytes: Vec<u8>) -> Result<(), PipelineError> {
        self.lock()?.insert(object_path.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, object_path: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        Ok(self.lock()?.get(object_path).cloned())
    }

    async fn delete(&self, object_path: &str) -> Result<bool, PipelineError> {
        Ok(self.lock()?.remove(object_path).is_some())
    }
}
