//! Error types for the edgequake-invoice library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal for the call**: the request cannot proceed
//!   (invalid upload, quota exhausted, unknown session, store failure).
//!   Returned as `Err(PipelineError)` from the [`crate::service`] entry points
//!   and rendered for clients as an [`ApiError`].
//!
//! * [`InferenceError`] — **Per upstream call**: a single request to the
//!   hosted model failed. These never escape the orchestrator; they drive
//!   the retry and OCR-fallback decisions and are folded into the session
//!   outcome as an [`ErrorCode`] plus message.

use crate::upload::UploadRejection;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Upload failed validation. Client error, never retried.
    UploadInvalid,
    /// Daily quota exhausted for the caller's scope.
    UsageLimit,
    /// Hosted model was slow or unavailable after the retry budget.
    AiTimeout,
    /// Hosted model answered, but not with the expected structure.
    ParseFail,
    /// The plain-text OCR fallback failed too. Terminal.
    OcrFail,
    /// Unknown session id.
    NotFound,
    /// A concurrent writer updated the session first.
    Conflict,
    /// Store or configuration failure.
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UploadInvalid => "UPLOAD_INVALID",
            ErrorCode::UsageLimit => "USAGE_LIMIT",
            ErrorCode::AiTimeout => "AI_TIMEOUT",
            ErrorCode::ParseFail => "PARSE_FAIL",
            ErrorCode::OcrFail => "OCR_FAIL",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// HTTP-equivalent status for the surrounding application layer.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::UploadInvalid => 400,
            ErrorCode::UsageLimit => 429,
            ErrorCode::AiTimeout => 504,
            ErrorCode::ParseFail => 502,
            ErrorCode::OcrFail => 502,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All fatal errors returned by the edgequake-invoice library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Client errors ─────────────────────────────────────────────────────
    /// The upload was rejected by the validator.
    #[error("Upload rejected: {0}")]
    UploadInvalid(UploadRejection),

    /// The caller's scope has used every upload for today.
    #[error("Daily upload limit of {limit} reached ({remaining} remaining)")]
    UsageLimit { limit: u32, count: u32, remaining: u32 },

    /// No session exists with the given id.
    #[error("Session '{id}' not found")]
    SessionNotFound { id: String },

    /// The session is not in a state that permits the requested operation.
    #[error("Session '{id}' cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Optimistic-concurrency check failed: someone else saved first.
    #[error("Session '{id}' was modified concurrently (expected version {expected}, found {found})")]
    Conflict { id: String, expected: u64, found: u64 },

    // ── Infrastructure errors ─────────────────────────────────────────────
    /// Blob, session or usage store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::UploadInvalid(_) => ErrorCode::UploadInvalid,
            PipelineError::UsageLimit { .. } => ErrorCode::UsageLimit,
            PipelineError::SessionNotFound { .. } => ErrorCode::NotFound,
            PipelineError::InvalidTransition { .. } | PipelineError::Conflict { .. } => {
                ErrorCode::Conflict
            }
            PipelineError::Storage(_)
            | PipelineError::ProviderNotConfigured { .. }
            | PipelineError::InvalidConfig(_)
            | PipelineError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.code().http_status()
    }

    /// Structured details for client display, when the error has any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            PipelineError::UploadInvalid(rejection) => serde_json::to_value(rejection).ok(),
            PipelineError::UsageLimit {
                limit,
                count,
                remaining,
            } => Some(serde_json::json!({
                "limit": limit,
                "count": count,
                "remaining": remaining,
            })),
            PipelineError::Conflict {
                expected, found, ..
            } => Some(serde_json::json!({ "expected": expected, "found": found })),
            _ => None,
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

impl From<UploadRejection> for PipelineError {
    fn from(rejection: UploadRejection) -> Self {
        PipelineError::UploadInvalid(rejection)
    }
}

/// The `{code, message, details}` body returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&PipelineError> for ApiError {
    fn from(e: &PipelineError) -> Self {
        e.to_api_error()
    }
}

/// A failure of a single call to the hosted inference service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    /// The call exceeded the configured deadline and was cancelled.
    #[error("inference call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// HTTP 429 or provider-reported throttling.
    #[error("rate limited by provider{}", .retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// 5xx-equivalent failure on the provider side.
    #[error("provider server error: {message}")]
    Server { message: String },

    /// Authentication, bad request, or other failure a retry will not fix.
    #[error("provider rejected the request: {message}")]
    Rejected { message: String },

    /// The provider answered, but the answer is unusable.
    #[error("malformed response: {detail}")]
    Malformed { detail: String },

    /// Uploading or deleting a temporary file handle failed.
    #[error("file handle error: {detail}")]
    FileHandle { detail: String },
}

impl InferenceError {
    /// Transient failures are expected to succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InferenceError::Timeout { .. }
                | InferenceError::RateLimited { .. }
                | InferenceError::Server { .. }
        )
    }

    /// Code recorded on the session when the structured call gives up with this error.
    pub fn structured_code(&self) -> ErrorCode {
        match self {
            InferenceError::Malformed { .. } => ErrorCode::ParseFail,
            _ => ErrorCode::AiTimeout,
        }
    }
}
