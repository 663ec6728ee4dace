//! A scripted [`InferenceBackend`] for offline tests and demos.
//!
//! Each call kind pops the next [`ScriptStep`] from its own queue. An
//! exhausted queue answers with a non-transient rejection, so a test that
//! under-scripts fails loudly instead of hanging.

use crate::error::InferenceError;
use crate::pipeline::backend::{FileHandle, InferenceBackend, InferenceRequest};
use crate::progress::CallKind;
use crate::upload::DocumentKind;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    Fail(InferenceError),
    /// Answer after a delay (tokio time, so it honours `time::pause`).
    Delay(Duration, String),
    /// Never answer.
    Hang,
}

#[derive(Default)]
struct Script {
    structured: VecDeque<ScriptStep>,
    ocr: VecDeque<ScriptStep>,
    upload_failure: Option<InferenceError>,
    calls: Vec<CallKind>,
    uploads: usize,
    open: HashSet<String>,
    deleted: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn structured(self, step: ScriptStep) -> Self {
        self.with(|s| s.structured.push_back(step));
        self
    }

    pub fn ocr(self, step: ScriptStep) -> Self {
        self.with(|s| s.ocr.push_back(step));
        self
    }

    pub fn fail_uploads(self, error: InferenceError) -> Self {
        self.with(|s| s.upload_failure = Some(error));
        self
    }

    /// Number of `generate` calls of the given kind so far.
    pub fn calls(&self, kind: CallKind) -> usize {
        self.with(|s| s.calls.iter().filter(|k| **k == kind).count())
    }

    pub fn uploads(&self) -> usize {
        self.with(|s| s.uploads)
    }

    /// Handles uploaded and not yet deleted.
    pub fn open_handles(&self) -> usize {
        self.with(|s| s.open.len())
    }

    pub fn deleted(&self) -> Vec<String> {
        self.with(|s| s.deleted.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut guard = match self.script.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn upload_file(
        &self,
        _bytes: &[u8],
        kind: DocumentKind,
    ) -> Result<FileHandle, InferenceError> {
        self.with(|s| {
            if let Some(e) = s.upload_failure.clone() {
                return Err(e);
            }
            s.uploads += 1;
            let id = format!("file-{}", s.uploads);
            s.open.insert(id.clone());
            Ok(FileHandle {
                id,
                mime_type: kind.mime_type().to_string(),
            })
        })
    }

    async fn delete_file(&self, handle: &FileHandle) -> Result<(), InferenceError> {
        self.with(|s| {
            s.open.remove(&handle.id);
            s.deleted.push(handle.id.clone());
        });
        Ok(())
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let step = self.with(|s| {
            s.calls.push(request.kind);
            match request.kind {
                CallKind::Structured => s.structured.pop_front(),
                CallKind::Ocr => s.ocr.pop_front(),
            }
        });

        match step {
            Some(ScriptStep::Reply(text)) => Ok(text),
            Some(ScriptStep::Fail(e)) => Err(e),
            Some(ScriptStep::Delay(d, text)) => {
                tokio::time::sleep(d).await;
                Ok(text)
            }
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => Err(InferenceError::Rejected {
                message: format!("no scripted {} response left", request.kind),
            }),
        }
    }
}
