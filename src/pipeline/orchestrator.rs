//! Drives one processing run: structured extraction, then OCR if needed.
//!
//! ## Retry Strategy
//!
//! Timeouts, 429s and 5xx answers from hosted models are transient and
//! frequent under load. They are retried sequentially with exponential
//! backoff (`retry_backoff_ms * 2^(attempt-1)`): with the 500 ms default and
//! two retries the waits are 500 ms → 1 s. Everything else, including a
//! response that fails the schema check, is final on the first attempt,
//! because the same prompt reproduces the same answer.
//!
//! ## Cancellation
//!
//! Every call runs under `tokio::time::timeout`. When it fires, the request
//! future is dropped, which closes the connection rather than leaving it
//! open in the background.

use crate::config::PipelineConfig;
use crate::error::{ErrorCode, InferenceError};
use crate::pipeline::backend::{
    DocumentPayload, FileHandle, InferenceBackend, InferenceRequest, RemoteFileGuard,
};
use crate::pipeline::confidence;
use crate::pipeline::encode::encode_inline;
use crate::pipeline::postprocess::clean_ocr_text;
use crate::pipeline::schema::{check_response, SchemaCheck};
use crate::progress::{CallKind, ExtractionProgressCallback, NoopProgressCallback};
use crate::prompts::{EXTRACTION_PROMPT, OCR_PROMPT};
use crate::session::Outcome;
use crate::upload::DocumentKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub struct Orchestrator {
    backend: Arc<dyn InferenceBackend>,
    config: Arc<PipelineConfig>,
    progress: Arc<dyn ExtractionProgressCallback>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: Arc<PipelineConfig>) -> Self {
        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        Self {
            backend,
            config,
            progress,
        }
    }

    /// Process one document and return its outcome. Never fails: every
    /// upstream failure is folded into [`Outcome`].
    pub async fn run(&self, session_id: &str, bytes: &[u8], kind: DocumentKind) -> Outcome {
        let start = Instant::now();

        let (payload, guard) = match self.prepare_payload(bytes, kind).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Session {}: document upload failed: {}", session_id, e);
                return Outcome::Failed {
                    code: ErrorCode::OcrFail,
                    message: format!("document could not be sent for extraction: {e}"),
                };
            }
        };

        let outcome = self.extract(session_id, payload).await;

        if let Some(guard) = guard {
            guard.release().await;
        }

        info!(
            "Session {}: run finished as {} in {:?}",
            session_id,
            outcome.status(),
            start.elapsed()
        );
        outcome
    }

    async fn prepare_payload(
        &self,
        bytes: &[u8],
        kind: DocumentKind,
    ) -> Result<(DocumentPayload, Option<RemoteFileGuard>), InferenceError> {
        if kind.is_image() {
            debug!("Inlining {} bytes of {}", bytes.len(), kind.mime_type());
            return Ok((
                DocumentPayload::Inline {
                    kind,
                    base64: encode_inline(bytes),
                },
                None,
            ));
        }

        let handle: FileHandle = match timeout(
            self.config.api_timeout(),
            self.backend.upload_file(bytes, kind),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(InferenceError::Timeout {
                    elapsed_ms: self.config.api_timeout().as_millis() as u64,
                })
            }
        };
        debug!("Uploaded {} bytes as file handle {}", bytes.len(), handle.id);
        let guard = RemoteFileGuard::new(Arc::clone(&self.backend), handle.clone());
        Ok((DocumentPayload::File(handle), Some(guard)))
    }

    async fn extract(&self, session_id: &str, payload: DocumentPayload) -> Outcome {
        let structured = InferenceRequest {
            instruction: self
                .config
                .extraction_prompt
                .clone()
                .unwrap_or_else(|| EXTRACTION_PROMPT.to_string()),
            payload: payload.clone(),
            kind: CallKind::Structured,
        };

        let (code, message) = match self.call_with_retry(session_id, &structured).await {
            Ok(text) => match check_response(&text) {
                SchemaCheck::Valid(raw) => {
                    let data = confidence::score(raw);
                    let flagged = data
                        .fields
                        .iter()
                        .filter(|f| confidence::is_low_confidence(f))
                        .count();
                    debug!(
                        "Session {}: {} fields extracted, {} below threshold",
                        session_id,
                        data.fields.len(),
                        flagged
                    );
                    return Outcome::Completed(data);
                }
                SchemaCheck::Invalid { reason } => {
                    warn!("Session {}: response failed schema check: {}", session_id, reason);
                    (ErrorCode::ParseFail, reason)
                }
            },
            Err(e) => (e.structured_code(), e.to_string()),
        };

        info!(
            "Session {}: structured extraction failed ({}), falling back to OCR",
            session_id, code
        );
        self.progress.on_fallback(session_id, code);

        let ocr = InferenceRequest {
            instruction: self
                .config
                .ocr_prompt
                .clone()
                .unwrap_or_else(|| OCR_PROMPT.to_string()),
            payload,
            kind: CallKind::Ocr,
        };

        match self.call_with_retry(session_id, &ocr).await {
            Ok(text) => {
                let text = clean_ocr_text(&text);
                if text.trim().is_empty() {
                    warn!("Session {}: OCR fallback returned no text", session_id);
                    Outcome::Failed {
                        code: ErrorCode::OcrFail,
                        message: "OCR fallback returned no text".into(),
                    }
                } else {
                    Outcome::NeedsReview {
                        ocr_text: text,
                        code,
                        message,
                    }
                }
            }
            Err(e) => {
                warn!("Session {}: OCR fallback failed: {}", session_id, e);
                Outcome::Failed {
                    code: ErrorCode::OcrFail,
                    message: format!("OCR fallback failed: {e}"),
                }
            }
        }
    }

    /// One logical call: bounded attempts, each under the deadline.
    pub async fn call_with_retry(
        &self,
        session_id: &str,
        request: &InferenceRequest,
    ) -> Result<String, InferenceError> {
        let max_attempts = self.config.max_retries + 1;
        let deadline = self.config.api_timeout();
        let mut attempt = 1;

        loop {
            self.progress
                .on_attempt(session_id, request.kind, attempt, max_attempts);
            let started = Instant::now();

            let result = match timeout(deadline, self.backend.generate(request)).await {
                Ok(result) => result,
                Err(_) => Err(InferenceError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            };

            match result {
                Ok(text) => {
                    debug!(
                        "Session {}: {} call returned {} bytes on attempt {}",
                        session_id,
                        request.kind,
                        text.len(),
                        attempt
                    );
                    return Ok(text);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.backoff_after(&e, attempt);
                    warn!(
                        "Session {}: {} attempt {}/{} failed ({}), retrying in {:?}",
                        session_id, request.kind, attempt, max_attempts, e, backoff
                    );
                    self.progress.on_retry(
                        session_id,
                        request.kind,
                        attempt,
                        backoff.as_millis() as u64,
                        &e.to_string(),
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "Session {}: {} call failed on attempt {}/{}: {}",
                        session_id, request.kind, attempt, max_attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Exponential backoff, but never shorter than a provider's
    /// `retry-after`, capped at the per-attempt deadline.
    fn backoff_after(&self, error: &InferenceError, attempt: u32) -> Duration {
        let backoff = self.config.backoff_for(attempt);
        match error {
            InferenceError::RateLimited {
                retry_after_secs: Some(secs),
            } => backoff.max(Duration::from_secs(*secs).min(self.config.api_timeout())),
            _ => backoff,
        }
    }
}
