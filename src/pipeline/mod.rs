//! Pipeline stages for one extraction run.
//!
//! Each submodule implements exactly one step, so each is independently
//! testable and the inference service can be swapped without touching the
//! retry or validation logic.
//!
//! ## Data Flow
//!
//! ```text
//! bytes ──▶ backend.upload_file ──▶ generate (structured) ──▶ schema ──▶ confidence
//!  (PDF)     (render + encode)            │ fails                         │
//!                                         ▼                               ▼
//!                                  generate (OCR) ──▶ postprocess    completed
//!                                         │                 │
//!                                         ▼                 ▼
//!                                      error          needs_review
//! ```
//!
//! 1. [`backend`]      the `InferenceBackend` seam and the file-handle guard
//! 2. [`llm`]          production backend over an `edgequake-llm` provider
//! 3. [`render`]       rasterise PDF pages; runs in `spawn_blocking`
//! 4. [`encode`]       PNG-encode and base64-wrap page images
//! 5. [`orchestrator`] timeout, retry, schema check, OCR fallback
//! 6. [`schema`]       strict check of the structured response
//! 7. [`confidence`]   per-field scoring and label-driven validation
//! 8. [`postprocess`]  deterministic cleanup of model output

pub mod backend;
pub mod confidence;
pub mod encode;
pub mod llm;
pub mod orchestrator;
pub mod postprocess;
pub mod render;
pub mod schema;
pub mod scripted;
