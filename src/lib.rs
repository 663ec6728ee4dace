//! # edgequake-invoice
//!
//! Extract structured data from invoices and receipts with Vision Language
//! Models (VLMs), with quota gating and an OCR fallback.
//!
//! ## Why this crate?
//!
//! Template-based invoice parsers break on every new vendor layout. Instead
//! this crate hands the document to a VLM and asks for labelled fields and
//! line items as JSON. Because models sometimes answer in prose or time out,
//! every run ends in one of three outcomes: `completed` with scored fields,
//! `needs_review` with raw OCR text for a human to map, or `error` with a
//! machine-readable code.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Validate  allow-list, size, magic bytes, PDF pages and scripts
//!  ├─ 2. Quota     per-user or per-IP-hash daily counter, pro plans exempt
//!  ├─ 3. Store     blob + expiring upload record
//!  ├─ 4. Extract   structured call with timeout and transient retries
//!  ├─ 5. Check     strict schema check, then confidence scoring
//!  ├─ 6. Fallback  verbatim OCR → needs_review
//!  └─ 7. Cleanup   eager delete, or TTL sweep
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_invoice::{
//!     CallerIdentity, CreateSessionRequest, ExtractionService, PipelineConfig, UploadSource,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let service = ExtractionService::builder(PipelineConfig::default()).build()?;
//!     let caller = CallerIdentity::anonymous("203.0.113.7");
//!
//!     let session = service
//!         .create_session(
//!             CreateSessionRequest {
//!                 file_name: "receipt.png".into(),
//!                 file_type: "image/png".into(),
//!                 file_size: 0,
//!                 source: UploadSource::DataUrl("data:image/png;base64,...".into()),
//!                 delete_after_processing: true,
//!             },
//!             &caller,
//!         )
//!         .await?;
//!
//!     let done = service.process_session(&session.id).await?;
//!     println!("{}", serde_json::to_string_pretty(&done)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `invoice-extract` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod approval;
pub mod blob;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod quota;
pub mod service;
pub mod session;
pub mod store;
pub mod upload;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use approval::{Step, WorkflowDefinition, WorkflowError};
pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{ApiError, ErrorCode, InferenceError, PipelineError};
pub use pipeline::backend::{DocumentPayload, FileHandle, InferenceBackend, InferenceRequest};
pub use pipeline::schema::{FieldCandidate, SchemaCheck};
pub use progress::{CallKind, ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use quota::{
    CallerIdentity, Entitlement, EntitlementSource, Plan, StaticEntitlements, SubscriptionStatus,
    UsageDecision,
};
pub use service::{ExtractionService, ExtractionServiceBuilder, SweepReport};
pub use session::{
    CreateSessionRequest, ExtractedData, ExtractedField, Outcome, ProcessingSession,
    SessionStatus, UploadSource,
};
pub use store::{StoreBackend, Stores};
pub use upload::{validate_upload, DocumentKind, UploadInfo, UploadPolicy, UploadRejection};
