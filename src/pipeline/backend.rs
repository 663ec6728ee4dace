//! The seam between the orchestrator and a hosted inference service.
//!
//! [`InferenceBackend`] is the only component that talks to the network.
//! Production uses [`super::llm::VisionLlmBackend`]; tests inject a scripted
//! double so retry, timeout and fallback behaviour can be exercised offline.

use crate::error::InferenceError;
use crate::progress::CallKind;
use crate::upload::DocumentKind;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Opaque handle to a document uploaded to the inference service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle {
    pub id: String,
    pub mime_type: String,
}

/// How the document travels with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentPayload {
    /// Base64 bytes embedded in the request body (images).
    Inline { kind: DocumentKind, base64: String },
    /// Previously uploaded file (PDFs).
    File(FileHandle),
}

/// One request to the hosted model.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub instruction: String,
    pub payload: DocumentPayload,
    pub kind: CallKind,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Upload a document for use by later `generate` calls.
    async fn upload_file(&self, bytes: &[u8], kind: DocumentKind)
        -> Result<FileHandle, InferenceError>;

    /// Release an uploaded document. Must tolerate already-deleted handles.
    async fn delete_file(&self, handle: &FileHandle) -> Result<(), InferenceError>;

    /// Run one generation and return the raw response text.
    async fn generate(&self, request: &InferenceRequest) -> Result<String, InferenceError>;
}

/// A backend for services that only manage sessions (usage, sweep) and
/// never run extraction. Every inference call is rejected.
pub struct OfflineBackend;

#[async_trait]
impl InferenceBackend for OfflineBackend {
    async fn upload_file(
        &self,
        _bytes: &[u8],
        _kind: DocumentKind,
    ) -> Result<FileHandle, InferenceError> {
        Err(InferenceError::Rejected {
            message: "inference is disabled for this service".into(),
        })
    }

    async fn delete_file(&self, _handle: &FileHandle) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn generate(&self, _request: &InferenceRequest) -> Result<String, InferenceError> {
        Err(InferenceError::Rejected {
            message: "inference is disabled for this service".into(),
        })
    }
}

/// Deletes an uploaded file handle exactly once.
///
/// Call [`RemoteFileGuard::release`] on the normal path. If the owning future
/// is dropped first (timeout, cancellation), `Drop` schedules the delete on
/// the current runtime instead.
pub struct RemoteFileGuard {
    backend: Arc<dyn InferenceBackend>,
    handle: Option<FileHandle>,
}

impl RemoteFileGuard {
    pub fn new(backend: Arc<dyn InferenceBackend>, handle: FileHandle) -> Self {
        Self {
            backend,
            handle: Some(handle),
        }
    }

    /// Delete the file now. Failures are logged, not returned.
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            match self.backend.delete_file(&handle).await {
                Ok(()) => debug!("Released file handle {}", handle.id),
                Err(e) => warn!("Failed to release file handle {}: {}", handle.id, e),
            }
        }
    }
}

impl Drop for RemoteFileGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let backend = Arc::clone(&self.backend);
                rt.spawn(async move {
                    if let Err(e) = backend.delete_file(&handle).await {
                        warn!("Deferred release of {} failed: {}", handle.id, e);
                    }
                });
            }
            Err(_) => warn!(
                "File handle {} leaked: no runtime available to release it",
                handle.id
            ),
        }
    }
}
