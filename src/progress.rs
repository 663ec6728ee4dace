//! Progress-callback trait for per-session extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as a session moves through the pipeline: status changes, each
//! upstream attempt, retries with their backoff, and the OCR fallback.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a Tokio broadcast channel, a WebSocket, a database record,
//! or a terminal spinner — without the library knowing anything about how the
//! host application communicates. The trait is `Send + Sync` because
//! independent sessions are processed concurrently.
//!
//! # Example
//!
//! ```rust
//! use edgequake_invoice::{CallKind, ExtractionProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct RetryCounter {
//!     retries: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for RetryCounter {
//!     fn on_retry(&self, session_id: &str, kind: CallKind, attempt: u32, backoff_ms: u64, reason: &str) {
//!         self.retries.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{session_id}: {kind} retry {attempt} in {backoff_ms}ms ({reason})");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(RetryCounter { retries: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::ErrorCode;
use crate::session::SessionStatus;
use std::fmt;
use std::sync::Arc;

/// Which upstream call an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// The structured (JSON) extraction call.
    Structured,
    /// The plain-text OCR fallback call.
    Ocr,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallKind::Structured => "structured",
            CallKind::Ocr => "ocr",
        })
    }
}

/// Called by the pipeline as it drives a session.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called after the session's status has been persisted.
    fn on_status_change(&self, session_id: &str, from: SessionStatus, to: SessionStatus) {
        let _ = (session_id, from, to);
    }

    /// Called just before an upstream call is issued.
    ///
    /// # Arguments
    /// * `attempt`      — 1-indexed attempt number
    /// * `max_attempts` — `max_retries + 1`
    fn on_attempt(&self, session_id: &str, kind: CallKind, attempt: u32, max_attempts: u32) {
        let _ = (session_id, kind, attempt, max_attempts);
    }

    /// Called when a transient failure is about to be retried.
    fn on_retry(&self, session_id: &str, kind: CallKind, attempt: u32, backoff_ms: u64, reason: &str) {
        let _ = (session_id, kind, attempt, backoff_ms, reason);
    }

    /// Called when structured extraction gave up and OCR is next.
    fn on_fallback(&self, session_id: &str, code: ErrorCode) {
        let _ = (session_id, code);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
