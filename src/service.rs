//! The library's entry point: session lifecycle on top of the pipeline.
//!
//! [`ExtractionService`] wires the validator, quota gate, blob store,
//! session store and orchestrator together. Every collaborator is injected
//! at construction; nothing here reaches for process-wide state.
//!
//! ```text
//! create_session ─▶ validate ─▶ reserve quota ─▶ store blob + record ─▶ uploading
//! process_session ─▶ processing ─▶ orchestrator ─▶ cleanup ─▶ completed | needs_review | error
//! submit_review   ─▶ needs_review ─▶ completed
//! sweep           ─▶ expired blobs, records and sessions removed
//! ```

use crate::blob::{object_path_for, BlobStore, MemoryBlobStore};
use crate::config::PipelineConfig;
use crate::error::{ErrorCode, PipelineError};
use crate::pipeline::backend::InferenceBackend;
use crate::pipeline::confidence;
use crate::pipeline::llm::VisionLlmBackend;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::schema::FieldCandidate;
use crate::progress::{ExtractionProgressCallback, NoopProgressCallback};
use crate::quota::{
    date_key, CallerIdentity, EntitlementSource, QuotaGate, StaticEntitlements, UsageDecision,
};
use crate::session::{
    CreateSessionRequest, ExtractedData, Outcome, ProcessingSession, SessionStatus,
    UploadRecord, UploadSource,
};
use crate::store::Stores;
use crate::upload::{decode_data_url, validate_upload, DocumentKind, UploadInfo, UploadRejection};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Blob deletions in flight at once during a sweep.
const SWEEP_CONCURRENCY: usize = 8;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub blobs_deleted: usize,
    pub records_deleted: usize,
    pub sessions_deleted: usize,
    /// Usage counters for past days.
    pub counters_pruned: usize,
}

pub struct ExtractionService {
    config: Arc<PipelineConfig>,
    stores: Stores,
    blobs: Arc<dyn BlobStore>,
    quota: QuotaGate,
    orchestrator: Orchestrator,
    progress: Arc<dyn ExtractionProgressCallback>,
}

/// Builder for [`ExtractionService`]. Unset collaborators default to
/// process-local stores, no entitlements, and the vision LLM backend
/// resolved from the config.
pub struct ExtractionServiceBuilder {
    config: PipelineConfig,
    stores: Option<Stores>,
    blobs: Option<Arc<dyn BlobStore>>,
    backend: Option<Arc<dyn InferenceBackend>>,
    entitlements: Option<Arc<dyn EntitlementSource>>,
}

impl ExtractionServiceBuilder {
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn entitlements(mut self, source: Arc<dyn EntitlementSource>) -> Self {
        self.entitlements = Some(source);
        self
    }

    pub fn build(self) -> Result<ExtractionService, PipelineError> {
        let config = Arc::new(self.config);
        let backend = match self.backend {
            Some(b) => b,
            None => Arc::new(VisionLlmBackend::from_config(&config)?),
        };
        let stores = self.stores.unwrap_or_else(Stores::memory);
        let blobs = self
            .blobs
            .unwrap_or_else(|| Arc::new(MemoryBlobStore::new()));
        let entitlements = self
            .entitlements
            .unwrap_or_else(|| Arc::new(StaticEntitlements::new()));

        let quota = QuotaGate::new(
            Arc::clone(&stores.usage),
            entitlements,
            config.daily_limit,
            config.ip_hash_salt.clone(),
        );
        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));

        Ok(ExtractionService {
            orchestrator: Orchestrator::new(backend, Arc::clone(&config)),
            config,
            stores,
            blobs,
            quota,
            progress,
        })
    }
}

impl ExtractionService {
    pub fn builder(config: PipelineConfig) -> ExtractionServiceBuilder {
        ExtractionServiceBuilder {
            config,
            stores: None,
            blobs: None,
            backend: None,
            entitlements: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ── Create ──────────────────────────────────────────────────────────────

    /// Validate an upload, reserve quota, store the bytes and open a session.
    ///
    /// Validation runs before the quota reservation, so a rejected file
    /// never costs the caller an upload.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
        identity: &CallerIdentity,
    ) -> Result<ProcessingSession, PipelineError> {
        let (bytes, existing_path) = match &request.source {
            UploadSource::DataUrl(url) => {
                let (mime, bytes) = decode_data_url(url)?;
                if DocumentKind::from_mime(&mime) != DocumentKind::from_mime(&request.file_type) {
                    return Err(UploadRejection::TypeMismatch {
                        declared: request.file_type.clone(),
                        detected: Some(mime),
                    }
                    .into());
                }
                (bytes, None)
            }
            UploadSource::ObjectPath(path) => {
                let bytes = self.blobs.get(path).await?.ok_or_else(|| {
                    UploadRejection::MissingObject {
                        object_path: path.clone(),
                    }
                })?;
                (bytes, Some(path.clone()))
            }
        };

        let (bytes, info) = self
            .validate(bytes, &request.file_type, request.file_size)
            .await?;

        let decision = self.quota.reserve(identity).await?;
        debug!(
            "Quota reserved: count={} remaining={:?} privileged={}",
            decision.count, decision.remaining, decision.privileged
        );

        let mut session = ProcessingSession::new(
            self.quota.scope_of(identity),
            request.file_name.clone(),
            info.kind.mime_type(),
            info.size,
            request.delete_after_processing,
        );
        session.transition(SessionStatus::Uploading)?;

        session.object_path = match existing_path {
            Some(path) => path,
            None => {
                let path = object_path_for(&session.id, &request.file_name);
                self.blobs.put(&path, bytes).await?;
                path
            }
        };

        self.stores
            .sessions
            .put_upload_record(&UploadRecord {
                object_path: session.object_path.clone(),
                session_id: session.id.clone(),
                expires_at: Utc::now() + self.config.upload_ttl(),
            })
            .await?;
        self.stores.sessions.insert(&session).await?;

        info!(
            "Session {} created: {} ({} bytes, pages={:?})",
            session.id,
            info.kind.mime_type(),
            info.size,
            info.page_count
        );
        self.progress
            .on_status_change(&session.id, SessionStatus::Idle, SessionStatus::Uploading);
        Ok(session)
    }

    async fn validate(
        &self,
        bytes: Vec<u8>,
        declared_mime: &str,
        declared_size: u64,
    ) -> Result<(Vec<u8>, UploadInfo), PipelineError> {
        let policy = self.config.upload_policy();
        let declared = declared_mime.to_string();
        // lopdf parsing of a 10 MiB PDF is CPU-bound.
        let (bytes, result) = tokio::task::spawn_blocking(move || {
            let result = validate_upload(&bytes, &declared, declared_size, &policy);
            (bytes, result)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("validation task panicked: {e}")))?;
        Ok((bytes, result?))
    }

    // ── Process ─────────────────────────────────────────────────────────────

    /// Run (or re-run) extraction for a session.
    ///
    /// Every save is a compare-and-set on the session version, so a
    /// concurrent run on the same session fails with `CONFLICT` instead of
    /// overwriting. A session left in `processing` by an abandoned run is
    /// reclaimed once [`PipelineConfig::max_run_duration`] has passed. The blob is released on every outcome path when the
    /// session asked for eager deletion.
    pub async fn process_session(&self, id: &str) -> Result<ProcessingSession, PipelineError> {
        let mut session = self.get_session(id).await?;

        let now = Utc::now();
        if session.is_stalled(now, self.config.max_run_duration()) {
            warn!(
                "Session {}: reclaiming run abandoned since {}",
                id, session.updated_at
            );
        }
        let from = session.begin_run(now, self.config.max_run_duration())?;
        session.clear_outcome();
        session.attempts += 1;
        session.version = self.stores.sessions.update(&session).await?;
        self.progress
            .on_status_change(id, from, SessionStatus::Processing);
        info!("Session {}: processing (run {})", id, session.attempts);

        let outcome = self.run_pipeline(&session).await;

        if session.delete_after_processing {
            self.release_upload(&session.object_path).await;
        }

        session.apply_outcome(outcome)?;
        session.version = self.stores.sessions.update(&session).await?;
        self.progress
            .on_status_change(id, SessionStatus::Processing, session.status);
        Ok(session)
    }

    async fn run_pipeline(&self, session: &ProcessingSession) -> Outcome {
        let Some(kind) = DocumentKind::from_mime(&session.file_type) else {
            return Outcome::Failed {
                code: ErrorCode::Internal,
                message: format!("unsupported stored file type '{}'", session.file_type),
            };
        };
        let bytes = match self.blobs.get(&session.object_path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(
                    "Session {}: upload {} is gone",
                    session.id, session.object_path
                );
                return Outcome::Failed {
                    code: ErrorCode::NotFound,
                    message: "the uploaded document is no longer available".into(),
                };
            }
            Err(e) => {
                return Outcome::Failed {
                    code: ErrorCode::Internal,
                    message: e.to_string(),
                }
            }
        };
        self.orchestrator.run(&session.id, &bytes, kind).await
    }

    /// Delete a blob and its record. Absent objects are fine; failures are logged.
    async fn release_upload(&self, object_path: &str) -> (bool, bool) {
        let blob = match self.blobs.delete(object_path).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("Failed to delete upload {}: {}", object_path, e);
                false
            }
        };
        let record = match self.stores.sessions.delete_upload_record(object_path).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("Failed to delete upload record {}: {}", object_path, e);
                false
            }
        };
        debug!(
            "Released upload {} (blob={}, record={})",
            object_path, blob, record
        );
        (blob, record)
    }

    // ── Read / review / delete ──────────────────────────────────────────────

    pub async fn get_session(&self, id: &str) -> Result<ProcessingSession, PipelineError> {
        self.stores
            .sessions
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound { id: id.to_string() })
    }

    /// Complete a `needs_review` session with manually mapped fields.
    pub async fn submit_review(
        &self,
        id: &str,
        fields: Vec<FieldCandidate>,
    ) -> Result<ProcessingSession, PipelineError> {
        let mut session = self.get_session(id).await?;
        if session.status != SessionStatus::NeedsReview {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: session.status.to_string(),
                to: SessionStatus::Completed.to_string(),
            });
        }

        let from = session.transition(SessionStatus::Completed)?;
        session.extracted = Some(ExtractedData {
            fields: confidence::score_fields(fields),
            line_items: None,
        });
        session.error_code = None;
        session.error_message = None;
        session.version = self.stores.sessions.update(&session).await?;

        info!("Session {}: review submitted", id);
        self.progress.on_status_change(id, from, session.status);
        Ok(session)
    }

    /// Remove a session with its blob and record. `false` if it did not exist.
    pub async fn delete_session(&self, id: &str) -> Result<bool, PipelineError> {
        let Some(session) = self.stores.sessions.get(id).await? else {
            return Ok(false);
        };
        self.release_upload(&session.object_path).await;
        let deleted = self.stores.sessions.delete(id).await?;
        info!("Session {} deleted", id);
        Ok(deleted)
    }

    pub async fn usage(&self, identity: &CallerIdentity) -> Result<UsageDecision, PipelineError> {
        self.quota.usage(identity).await
    }

    // ── Sweep ───────────────────────────────────────────────────────────────

    /// Delete expired uploads and sessions older than the session TTL.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, PipelineError> {
        let mut report = SweepReport::default();

        let expired = self.stores.sessions.expired_upload_records(now).await?;
        let released: Vec<(bool, bool)> = stream::iter(expired)
            .map(|record| async move { self.release_upload(&record.object_path).await })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;
        for (blob, rec) in released {
            report.blobs_deleted += blob as usize;
            report.records_deleted += rec as usize;
        }

        let cutoff = now - self.config.session_ttl();
        for id in self.stores.sessions.sessions_created_before(cutoff).await? {
            if let Ok(Some(session)) = self.stores.sessions.get(&id).await {
                let (blob, rec) = self.release_upload(&session.object_path).await;
                report.blobs_deleted += blob as usize;
                report.records_deleted += rec as usize;
            }
            match self.stores.sessions.delete(&id).await {
                Ok(true) => report.sessions_deleted += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to delete expired session {}: {}", id, e),
            }
        }

        report.counters_pruned = self.stores.usage.prune_before(&date_key(now)).await?;

        if report != SweepReport::default() {
            info!(
                "Sweep removed {} blobs, {} records, {} sessions, {} usage counters",
                report.blobs_deleted,
                report.records_deleted,
                report.sessions_deleted,
                report.counters_pruned
            );
        }
        Ok(report)
    }

    /// Run [`Self::sweep`] every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = service.sweep(Utc::now()).await {
                    warn!("Sweep failed: {}", e);
                }
            }
        })
    }
}
