//! Session and extraction result types.
//!
//! A [`ProcessingSession`] is the unit the surrounding application talks
//! about: one uploaded document, its storage pointer, and the outcome of the
//! most recent processing attempt. The outcome is three-way, not binary —
//! `completed` with [`ExtractedData`], `needs_review` with raw OCR text, or
//! `error` with a code — so every consumer has to handle the degraded path.

use crate::error::{ErrorCode, PipelineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of a session.
///
/// ```text
/// idle ─▶ uploading ─▶ processing ─┬─▶ completed
///                                  ├─▶ needs_review ─(submit_review)─▶ completed
///                                  └─▶ error
/// terminal states ─(re-run)─▶ processing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Uploading,
    Processing,
    Completed,
    NeedsReview,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::NeedsReview => "needs_review",
            SessionStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::NeedsReview | SessionStatus::Error
        )
    }

    /// The transition table.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (*self, next) {
            (Idle, Uploading) => true,
            (Uploading, Processing) | (Uploading, Error) => true,
            (Processing, Completed) | (Processing, NeedsReview) | (Processing, Error) => true,
            (NeedsReview, Completed) => true,
            (from, Processing) => from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extracted label/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub label: String,
    pub value: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl ExtractedField {
    pub fn new(label: impl Into<String>, value: Option<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            value,
            confidence,
            issues: Vec::new(),
        }
    }

    /// `true` when the value is missing or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.value.as_deref().is_none_or(|v| v.trim().is_empty())
    }
}

/// A line-item row. Column sets vary from row to row.
pub type LineItem = BTreeMap<String, serde_json::Value>;

/// Structured extraction output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub fields: Vec<ExtractedField>,
    #[serde(default, rename = "lineItems", skip_serializing_if = "Option::is_none")]
    pub line_items: Option<Vec<LineItem>>,
}

impl ExtractedData {
    pub fn has_value(&self) -> bool {
        self.fields.iter().any(|f| !f.is_blank())
    }

    pub fn field(&self, label: &str) -> Option<&ExtractedField> {
        self.fields
            .iter()
            .find(|f| f.label.eq_ignore_ascii_case(label))
    }
}

/// Where the bytes of a new session come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadSource {
    /// `data:<mime>;base64,<payload>`
    DataUrl(String),
    /// Object already present in the blob store.
    ObjectPath(String),
}

/// Inbound create-session request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub source: UploadSource,
    #[serde(default)]
    pub delete_after_processing: bool,
}

/// Persisted state of one uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSession {
    pub id: String,
    /// Quota scope of the creator (`user:…` or `ip:<hash>`).
    pub scope: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub object_path: String,
    pub delete_after_processing: bool,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<ExtractedData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Number of processing runs so far.
    pub attempts: u32,
    /// Optimistic-concurrency token, bumped by every successful save.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingSession {
    pub fn new(
        scope: impl Into<String>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        file_size: u64,
        delete_after_processing: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            scope: scope.into(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_size,
            object_path: String::new(),
            delete_after_processing,
            status: SessionStatus::Idle,
            extracted: None,
            ocr_text: None,
            error_code: None,
            error_message: None,
            attempts: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions outside the table.
    pub fn transition(&mut self, next: SessionStatus) -> Result<SessionStatus, PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let prev = self.status;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(prev)
    }

    /// Enter `processing` for a new run.
    ///
    /// A session still `processing` after `stall_after` was left behind by a
    /// run that never finished (cancelled or crashed) and may be started
    /// again. Otherwise the transition table applies.
    pub fn begin_run(
        &mut self,
        now: DateTime<Utc>,
        stall_after: Duration,
    ) -> Result<SessionStatus, PipelineError> {
        if self.is_stalled(now, stall_after) {
            self.updated_at = now;
            return Ok(SessionStatus::Processing);
        }
        self.transition(SessionStatus::Processing)
    }

    pub fn is_stalled(&self, now: DateTime<Utc>, stall_after: Duration) -> bool {
        self.status == SessionStatus::Processing
            && chrono::Duration::from_std(stall_after)
                .map(|limit| now - self.updated_at > limit)
                .unwrap_or(false)
    }

    /// Drop any previous outcome before a new run writes its own.
    pub fn clear_outcome(&mut self) {
        self.extracted = None;
        self.ocr_text = None;
        self.error_code = None;
        self.error_message = None;
    }

    /// Apply the result of a processing run. Overwrites the prior outcome.
    pub fn apply_outcome(&mut self, outcome: Outcome) -> Result<(), PipelineError> {
        self.clear_outcome();
        match outcome {
            Outcome::Completed(data) => {
                self.transition(SessionStatus::Completed)?;
                self.extracted = Some(data);
            }
            Outcome::NeedsReview {
                ocr_text,
                code,
                message,
            } => {
                self.transition(SessionStatus::NeedsReview)?;
                self.extracted = Some(ExtractedData::default());
                self.ocr_text = Some(ocr_text);
                self.error_code = Some(code);
                self.error_message = Some(message);
            }
            Outcome::Failed { code, message } => {
                self.transition(SessionStatus::Error)?;
                self.error_code = Some(code);
                self.error_message = Some(message);
            }
        }
        Ok(())
    }
}

/// Result of one processing run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(ExtractedData),
    /// Structured extraction failed but OCR text is available.
    NeedsReview {
        ocr_text: String,
        code: ErrorCode,
        message: String,
    },
    Failed { code: ErrorCode, message: String },
}

impl Outcome {
    pub fn status(&self) -> SessionStatus {
        match self {
            Outcome::Completed(_) => SessionStatus::Completed,
            Outcome::NeedsReview { .. } => SessionStatus::NeedsReview,
            Outcome::Failed { .. } => SessionStatus::Error,
        }
    }
}

/// Pointer to an ephemeral blob with an expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub object_path: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ProcessingSession {
        ProcessingSession::new("user:1", "a.pdf", "application/pdf", 10, false)
    }

    #[test]
    fn transition_table() {
        use SessionStatus::*;
        assert!(Idle.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Processing));
        assert!(Processing.can_transition_to(NeedsReview));
        assert!(Error.can_transition_to(Processing));
        assert!(Completed.can_transition_to(Processing));
        assert!(NeedsReview.can_transition_to(Completed));
        assert!(!Idle.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Uploading));
    }

    #[test]
    fn processing_session_is_reclaimed_only_after_stall_window() {
        let mut s = session();
        s.transition(SessionStatus::Uploading).unwrap();
        s.transition(SessionStatus::Processing).unwrap();
        let window = Duration::from_secs(30);

        let soon = s.updated_at + chrono::Duration::seconds(10);
        assert!(!s.is_stalled(soon, window));
        let err = s.begin_run(soon, window).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        let late = s.updated_at + chrono::Duration::seconds(31);
        assert!(s.is_stalled(late, window));
        assert_eq!(s.begin_run(late, window).unwrap(), SessionStatus::Processing);
        assert_eq!(s.updated_at, late);
        assert!(!s.is_stalled(late, window));
    }

    #[test]
    fn begin_run_follows_table_for_other_states() {
        let mut s = session();
        let now = Utc::now();
        assert!(s.begin_run(now, Duration::ZERO).is_err());
        s.transition(SessionStatus::Uploading).unwrap();
        assert_eq!(
            s.begin_run(now, Duration::ZERO).unwrap(),
            SessionStatus::Uploading
        );
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut s = session();
        let err = s.transition(SessionStatus::Completed).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert_eq!(s.status, SessionStatus::Idle);
    }

    #[test]
    fn rerun_overwrites_prior_outcome() {
        let mut s = session();
        s.transition(SessionStatus::Uploading).unwrap();
        s.transition(SessionStatus::Processing).unwrap();
        s.apply_outcome(Outcome::Failed {
            code: ErrorCode::OcrFail,
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(s.error_code, Some(ErrorCode::OcrFail));

        s.transition(SessionStatus::Processing).unwrap();
        s.apply_outcome(Outcome::Completed(ExtractedData {
            fields: vec![ExtractedField::new("Total", Some("10".into()), 0.9)],
            line_items: None,
        }))
        .unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.error_code.is_none());
        assert!(s.extracted.as_ref().unwrap().has_value());
    }

    #[test]
    fn needs_review_keeps_structured_error_for_diagnostics() {
        let mut s = session();
        s.transition(SessionStatus::Uploading).unwrap();
        s.transition(SessionStatus::Processing).unwrap();
        s.apply_outcome(Outcome::NeedsReview {
            ocr_text: "INVOICE\nTotal 10".into(),
            code: ErrorCode::ParseFail,
            message: "fields array is empty".into(),
        })
        .unwrap();
        assert_eq!(s.status, SessionStatus::NeedsReview);
        assert_eq!(s.error_code, Some(ErrorCode::ParseFail));
        assert!(s.extracted.as_ref().unwrap().fields.is_empty());
    }

    #[test]
    fn session_serialises_camel_case() {
        let json = serde_json::to_value(session()).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["fileName"], "a.pdf");
        assert!(json.get("errorCode").is_none());
    }

    #[test]
    fn blank_detection() {
        assert!(ExtractedField::new("x", None, 0.5).is_blank());
        assert!(ExtractedField::new("x", Some("  ".into()), 0.5).is_blank());
        assert!(!ExtractedField::new("x", Some("1".into()), 0.5).is_blank());
    }
}
