//! Offline integration tests for the extraction service.
//!
//! Every test drives [`ExtractionService`] end to end against a
//! [`ScriptedBackend`], so retry, timeout, fallback and cleanup behaviour is
//! exercised without network access or API keys. Tests that depend on
//! timeouts run with the tokio clock paused.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{Duration as ChronoDuration, Utc};
use edgequake_invoice::pipeline::scripted::{ScriptStep, ScriptedBackend};
use edgequake_invoice::{
    BlobStore, CallKind, CallerIdentity, CreateSessionRequest, Entitlement, ErrorCode,
    ExtractionProgressCallback, ExtractionService, FieldCandidate, FsBlobStore, InferenceError,
    MemoryBlobStore, PipelineConfig, PipelineConfigBuilder, PipelineError, Plan,
    StaticEntitlements, StoreBackend, Stores, SessionStatus, SubscriptionStatus, UploadRejection,
    UploadSource,
};
use lopdf::{dictionary, Document, Object, Stream, StringFormat};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

const VALID_RESPONSE: &str = r#"```json
{
  "fields": [
    {"label": "Invoice Number", "value": "INV-2024-001", "confidence": 0.95},
    {"label": "Invoice Date", "value": "2024-03-05", "confidence": 0.9},
    {"label": "Total", "value": "€ 1.190,00", "confidence": 0.9},
    {"label": "VAT", "value": "190,00", "confidence": 0.85},
    {"label": "PO Number", "value": null}
  ],
  "lineItems": [
    {"description": "Consulting", "qty": 10, "amount": "1000.00"}
  ]
}
```"#;

const OCR_TEXT: &str = "ACME GmbH\nRechnung Nr. 42\nGesamt 119,00 EUR";

fn png_bytes() -> Vec<u8> {
    let mut v = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    v.extend_from_slice(&[0, 0, 0, 13, b'I', b'H', b'D', b'R']);
    v.extend_from_slice(&[0u8; 17]);
    v
}

/// A minimal PDF with `pages` blank pages, optionally carrying an
/// `/OpenAction` JavaScript action.
fn pdf_bytes(pages: usize, with_script: bool) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        b"BT /F1 12 Tf 72 720 Td (Total 119.00) Tj ET".to_vec(),
    ));

    let kids: Vec<Object> = (0..pages)
        .map(|_| {
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Contents" => content_id,
            })
            .into()
        })
        .collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );

    let mut catalog = dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    };
    if with_script {
        let action_id = doc.add_object(dictionary! {
            "S" => "JavaScript",
            "JS" => Object::String(b"app.launchURL('x')".to_vec(), StringFormat::Literal),
        });
        catalog.set("OpenAction", action_id);
    }
    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

fn request(file_name: &str, mime: &str, bytes: &[u8], eager: bool) -> CreateSessionRequest {
    CreateSessionRequest {
        file_name: file_name.into(),
        file_type: mime.into(),
        file_size: bytes.len() as u64,
        source: UploadSource::DataUrl(data_url(mime, bytes)),
        delete_after_processing: eager,
    }
}

fn png_request(eager: bool) -> CreateSessionRequest {
    request("receipt.png", "image/png", &png_bytes(), eager)
}

fn pdf_request(pages: usize, eager: bool) -> CreateSessionRequest {
    request("invoice.pdf", "application/pdf", &pdf_bytes(pages, false), eager)
}

fn caller() -> CallerIdentity {
    CallerIdentity::anonymous("198.51.100.23")
}

struct Harness {
    service: ExtractionService,
    backend: Arc<ScriptedBackend>,
    blobs: Arc<MemoryBlobStore>,
    stores: Stores,
}

fn harness(
    backend: ScriptedBackend,
    configure: impl FnOnce(PipelineConfigBuilder) -> PipelineConfigBuilder,
) -> Harness {
    let config = configure(
        PipelineConfig::builder()
            .retry_backoff_ms(1)
            .daily_limit(100),
    )
    .build()
    .unwrap();

    let backend = Arc::new(backend);
    let blobs = Arc::new(MemoryBlobStore::new());
    let stores = Stores::memory();
    let service = ExtractionService::builder(config)
        .backend(backend.clone())
        .blobs(blobs.clone())
        .stores(stores.clone())
        .build()
        .unwrap();

    Harness {
        service,
        backend,
        blobs,
        stores,
    }
}

async fn open_records(stores: &Stores) -> usize {
    stores
        .sessions
        .expired_upload_records(Utc::now() + ChronoDuration::days(365))
        .await
        .unwrap()
        .len()
}

#[derive(Default)]
struct TrackingCallback {
    attempts: AtomicUsize,
    retries: AtomicUsize,
    fallbacks: Mutex<Vec<ErrorCode>>,
    statuses: Mutex<Vec<SessionStatus>>,
}

impl ExtractionProgressCallback for TrackingCallback {
    fn on_status_change(&self, _id: &str, _from: SessionStatus, to: SessionStatus) {
        self.statuses.lock().unwrap().push(to);
    }

    fn on_attempt(&self, _id: &str, _kind: CallKind, _attempt: u32, _max: u32) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_retry(&self, _id: &str, _kind: CallKind, _attempt: u32, _backoff: u64, _reason: &str) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn on_fallback(&self, _id: &str, code: ErrorCode) {
        self.fallbacks.lock().unwrap().push(code);
    }
}

// ── Structured extraction ────────────────────────────────────────────────────

#[tokio::test]
async fn test_image_completes_with_scored_fields() {
    let h = harness(
        ScriptedBackend::new().structured(ScriptStep::Reply(VALID_RESPONSE.into())),
        |b| b,
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    assert_eq!(session.status, SessionStatus::Uploading);
    assert_eq!(session.file_type, "image/png");

    let done = h.service.process_session(&session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.attempts, 1);
    assert!(done.error_code.is_none());
    assert!(done.ocr_text.is_none());

    let data = done.extracted.as_ref().unwrap();
    assert_eq!(data.fields.len(), 5);
    assert_eq!(data.line_items.as_ref().unwrap().len(), 1);

    let number = data.field("Invoice Number").unwrap();
    assert!((number.confidence - 0.95).abs() < 1e-6);
    assert!(number.issues.is_empty());

    let po = data.field("PO Number").unwrap();
    assert!(po.confidence < 0.5);
    assert!(!po.issues.is_empty());

    // Images go inline; nothing is uploaded to the inference service.
    assert_eq!(h.backend.uploads(), 0);
    assert_eq!(h.backend.calls(CallKind::Structured), 1);
    assert_eq!(h.backend.calls(CallKind::Ocr), 0);

    let stored = h.service.get_session(&session.id).await.unwrap();
    assert_eq!(stored, done);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_then_success_completes() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Hang)
            .structured(ScriptStep::Hang)
            .structured(ScriptStep::Reply(VALID_RESPONSE.into())),
        |b| b.max_retries(2).api_timeout_secs(60),
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(h.backend.calls(CallKind::Structured), 3);
    assert_eq!(h.backend.calls(CallKind::Ocr), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_exhausted_fall_back_to_ocr() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Hang)
            .structured(ScriptStep::Hang)
            .structured(ScriptStep::Hang)
            .ocr(ScriptStep::Reply(format!("```\n{OCR_TEXT}\n```"))),
        |b| b.max_retries(2).api_timeout_secs(30),
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::NeedsReview);
    assert_eq!(done.error_code, Some(ErrorCode::AiTimeout));
    assert_eq!(done.ocr_text.as_deref(), Some(OCR_TEXT));
    assert!(done.extracted.is_none());
    assert_eq!(h.backend.calls(CallKind::Structured), 3);
    assert_eq!(h.backend.calls(CallKind::Ocr), 1);
}

#[tokio::test]
async fn test_empty_fields_is_parse_fail_without_retry() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Reply(r#"{"fields": []}"#.into()))
            .ocr(ScriptStep::Reply(OCR_TEXT.into())),
        |b| b.max_retries(2),
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::NeedsReview);
    assert_eq!(done.error_code, Some(ErrorCode::ParseFail));
    assert_eq!(done.ocr_text.as_deref(), Some(OCR_TEXT));
    assert_eq!(h.backend.calls(CallKind::Structured), 1);
    assert_eq!(h.backend.calls(CallKind::Ocr), 1);
}

#[tokio::test]
async fn test_prose_answer_falls_back_to_ocr() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Reply(
                "I'm sorry, this image looks like a receipt but I cannot read it.".into(),
            ))
            .ocr(ScriptStep::Reply(OCR_TEXT.into())),
        |b| b,
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::NeedsReview);
    assert_eq!(done.error_code, Some(ErrorCode::ParseFail));
}

#[tokio::test]
async fn test_ocr_failure_is_terminal_error() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Fail(InferenceError::Rejected {
                message: "content policy".into(),
            }))
            .ocr(ScriptStep::Fail(InferenceError::Server {
                message: "503".into(),
            }))
            .ocr(ScriptStep::Fail(InferenceError::Server {
                message: "503".into(),
            }))
            .ocr(ScriptStep::Fail(InferenceError::Server {
                message: "503".into(),
            })),
        |b| b.max_retries(2),
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Error);
    assert_eq!(done.error_code, Some(ErrorCode::OcrFail));
    assert!(done.error_message.is_some());
    assert!(done.ocr_text.is_none());
    // Non-transient failures are not retried; transient ones are.
    assert_eq!(h.backend.calls(CallKind::Structured), 1);
    assert_eq!(h.backend.calls(CallKind::Ocr), 3);
}

#[tokio::test]
async fn test_blank_ocr_text_is_terminal_error() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Reply(r#"{"fields": [{"label": "Total", "value": ""}]}"#.into()))
            .ocr(ScriptStep::Reply("  \n\n ".into())),
        |b| b,
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Error);
    assert_eq!(done.error_code, Some(ErrorCode::OcrFail));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_for_retry_after() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Fail(InferenceError::RateLimited {
                retry_after_secs: Some(5),
            }))
            .structured(ScriptStep::Fail(InferenceError::RateLimited {
                retry_after_secs: Some(600),
            }))
            .structured(ScriptStep::Reply(VALID_RESPONSE.into())),
        |b| b.api_timeout_secs(20).max_retries(2),
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    let started = tokio::time::Instant::now();
    let done = h.service.process_session(&session.id).await.unwrap();
    let waited = started.elapsed();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(h.backend.calls(CallKind::Structured), 3);
    // 5s as asked, then 600s capped to the 20s deadline.
    assert!(waited >= Duration::from_secs(25), "waited {waited:?}");
    assert!(waited < Duration::from_secs(30), "waited {waited:?}");
}

#[tokio::test]
async fn test_progress_events_follow_the_run() {
    let tracker = Arc::new(TrackingCallback::default());
    let cb = tracker.clone();
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Fail(InferenceError::RateLimited {
                retry_after_secs: None,
            }))
            .structured(ScriptStep::Reply("not json".into()))
            .ocr(ScriptStep::Reply(OCR_TEXT.into())),
        move |b| b.progress_callback(cb),
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    h.service.process_session(&session.id).await.unwrap();

    assert_eq!(tracker.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(tracker.retries.load(Ordering::SeqCst), 1);
    assert_eq!(*tracker.fallbacks.lock().unwrap(), vec![ErrorCode::ParseFail]);
    assert_eq!(
        *tracker.statuses.lock().unwrap(),
        vec![
            SessionStatus::Uploading,
            SessionStatus::Processing,
            SessionStatus::NeedsReview
        ]
    );
}

// ── Remote file handles ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_pdf_handle_released_after_success() {
    let h = harness(
        ScriptedBackend::new().structured(ScriptStep::Reply(VALID_RESPONSE.into())),
        |b| b,
    );

    let session = h.service.create_session(pdf_request(2, true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(h.backend.uploads(), 1);
    assert_eq!(h.backend.open_handles(), 0);
    assert_eq!(h.backend.deleted(), vec!["file-1".to_string()]);
}

#[tokio::test]
async fn test_pdf_handle_released_after_failure() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Fail(InferenceError::Rejected {
                message: "bad request".into(),
            }))
            .ocr(ScriptStep::Fail(InferenceError::Rejected {
                message: "bad request".into(),
            })),
        |b| b,
    );

    let session = h.service.create_session(pdf_request(1, true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Error);
    assert_eq!(h.backend.uploads(), 1);
    assert_eq!(h.backend.open_handles(), 0);
    assert_eq!(h.backend.deleted().len(), 1);
}

#[tokio::test]
async fn test_pdf_upload_failure_is_ocr_fail() {
    let h = harness(
        ScriptedBackend::new().fail_uploads(InferenceError::FileHandle {
            detail: "storage quota exceeded".into(),
        }),
        |b| b,
    );

    let session = h.service.create_session(pdf_request(1, true), &caller()).await.unwrap();
    let done = h.service.process_session(&session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Error);
    assert_eq!(done.error_code, Some(ErrorCode::OcrFail));
    assert_eq!(h.backend.calls(CallKind::Structured), 0);
    assert!(h.blobs.is_empty());
}

// ── Storage lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_eager_deletion_on_every_outcome() {
    let h = harness(
        ScriptedBackend::new()
            // completed
            .structured(ScriptStep::Reply(VALID_RESPONSE.into()))
            // needs_review
            .structured(ScriptStep::Reply("{}".into()))
            .ocr(ScriptStep::Reply(OCR_TEXT.into()))
            // error
            .structured(ScriptStep::Reply("{}".into()))
            .ocr(ScriptStep::Reply(String::new())),
        |b| b,
    );

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
        assert!(h.blobs.contains(&session.object_path));

        let done = h.service.process_session(&session.id).await.unwrap();
        assert!(!h.blobs.contains(&session.object_path));
        statuses.push(done.status);
    }

    assert_eq!(
        statuses,
        vec![
            SessionStatus::Completed,
            SessionStatus::NeedsReview,
            SessionStatus::Error
        ]
    );
    assert!(h.blobs.is_empty());
    assert_eq!(open_records(&h.stores).await, 0);
}

#[tokio::test]
async fn test_kept_upload_removed_by_sweep_after_ttl() {
    let h = harness(
        ScriptedBackend::new().structured(ScriptStep::Reply(VALID_RESPONSE.into())),
        |b| b.upload_ttl_secs(3600).session_ttl_secs(86_400),
    );

    let session = h.service.create_session(png_request(false), &caller()).await.unwrap();
    h.service.process_session(&session.id).await.unwrap();
    assert!(h.blobs.contains(&session.object_path));

    let now = Utc::now();
    let early = h.service.sweep(now).await.unwrap();
    assert_eq!(early.blobs_deleted, 0);
    assert!(h.blobs.contains(&session.object_path));

    let after_ttl = h.service.sweep(now + ChronoDuration::hours(2)).await.unwrap();
    assert_eq!(after_ttl.blobs_deleted, 1);
    assert_eq!(after_ttl.records_deleted, 1);
    assert_eq!(after_ttl.sessions_deleted, 0);
    assert!(h.blobs.is_empty());
    assert!(h.service.get_session(&session.id).await.is_ok());

    let after_session_ttl = h
        .service
        .sweep(now + ChronoDuration::hours(25))
        .await
        .unwrap();
    assert_eq!(after_session_ttl.sessions_deleted, 1);
    assert_eq!(after_session_ttl.counters_pruned, 1);
    let err = h.service.get_session(&session.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_rerun_after_eager_delete_reports_missing_upload() {
    let h = harness(
        ScriptedBackend::new().structured(ScriptStep::Reply(VALID_RESPONSE.into())),
        |b| b,
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    h.service.process_session(&session.id).await.unwrap();

    let rerun = h.service.process_session(&session.id).await.unwrap();
    assert_eq!(rerun.status, SessionStatus::Error);
    assert_eq!(rerun.error_code, Some(ErrorCode::NotFound));
    assert_eq!(rerun.attempts, 2);
    assert!(rerun.extracted.is_none());
}

#[tokio::test]
async fn test_delete_session_is_idempotent() {
    let h = harness(ScriptedBackend::new(), |b| b);

    let session = h.service.create_session(png_request(false), &caller()).await.unwrap();
    assert_eq!(h.blobs.len(), 1);

    assert!(h.service.delete_session(&session.id).await.unwrap());
    assert!(h.blobs.is_empty());
    assert_eq!(open_records(&h.stores).await, 0);
    assert!(!h.service.delete_session(&session.id).await.unwrap());
}

// ── Concurrency ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_rerun_conflicts() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Reply(VALID_RESPONSE.into()))
            .structured(ScriptStep::Delay(
                Duration::from_millis(20),
                VALID_RESPONSE.into(),
            )),
        |b| b,
    );

    let session = h.service.create_session(png_request(false), &caller()).await.unwrap();
    h.service.process_session(&session.id).await.unwrap();

    let (a, b) = tokio::join!(
        h.service.process_session(&session.id),
        h.service.process_session(&session.id)
    );

    let (ok, err): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(Result::is_ok);
    assert_eq!(ok.len(), 1);
    assert_eq!(err.len(), 1);
    let err = err.into_iter().next().unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
    assert_eq!(err.http_status(), 409);

    let stored = h.service.get_session(&session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert_eq!(stored.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_run_is_reclaimed_after_run_bound() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Hang)
            .structured(ScriptStep::Reply(VALID_RESPONSE.into())),
        |b| b.api_timeout_secs(1).max_retries(0),
    );

    let session = h.service.create_session(png_request(false), &caller()).await.unwrap();
    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        h.service.process_session(&session.id),
    )
    .await;
    assert!(cancelled.is_err());

    let stuck = h.service.get_session(&session.id).await.unwrap();
    assert_eq!(stuck.status, SessionStatus::Processing);

    // A run that may still be alive is not stolen.
    let err = h.service.process_session(&session.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    let mut abandoned = stuck.clone();
    abandoned.updated_at = Utc::now() - ChronoDuration::minutes(5);
    h.stores.sessions.update(&abandoned).await.unwrap();

    let done = h.service.process_session(&session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.attempts, 2);
    assert_eq!(h.backend.calls(CallKind::Structured), 2);
}

#[tokio::test]
async fn test_stale_session_save_is_rejected() {
    let h = harness(ScriptedBackend::new(), |b| b);

    let session = h.service.create_session(png_request(false), &caller()).await.unwrap();
    let mut first = h.service.get_session(&session.id).await.unwrap();
    let mut second = first.clone();

    first.transition(SessionStatus::Error).unwrap();
    h.stores.sessions.update(&first).await.unwrap();

    second.transition(SessionStatus::Processing).unwrap();
    let err = h.stores.sessions.update(&second).await.unwrap_err();
    assert!(matches!(err, PipelineError::Conflict { .. }));
    assert_eq!(err.code(), ErrorCode::Conflict);
}

// ── Quota ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_usage_limit_enforced() {
    let h = harness(ScriptedBackend::new(), |b| b.daily_limit(3));

    for _ in 0..3 {
        h.service.create_session(png_request(false), &caller()).await.unwrap();
    }

    let err = h
        .service
        .create_session(png_request(false), &caller())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UsageLimit);
    assert_eq!(err.http_status(), 429);

    let api = err.to_api_error();
    let details = api.details.unwrap();
    assert_eq!(details["limit"], 3);
    assert_eq!(details["remaining"], 0);

    // Nothing was stored for the denied upload.
    assert_eq!(h.blobs.len(), 3);

    // A different address has its own budget.
    let other = CallerIdentity::anonymous("203.0.113.99");
    assert!(h.service.create_session(png_request(false), &other).await.is_ok());
}

#[tokio::test]
async fn test_rejected_upload_does_not_consume_quota() {
    let h = harness(ScriptedBackend::new(), |b| b.daily_limit(1));

    let bad = request("evil.pdf", "application/pdf", &pdf_bytes(1, true), false);
    let err = h.service.create_session(bad, &caller()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::UploadInvalid);

    let usage = h.service.usage(&caller()).await.unwrap();
    assert_eq!(usage.count, 0);
    assert_eq!(usage.remaining, Some(1));

    assert!(h.service.create_session(png_request(false), &caller()).await.is_ok());
}

#[tokio::test]
async fn test_pro_plan_bypasses_limit() {
    let config = PipelineConfig::builder().daily_limit(1).build().unwrap();
    let entitlements = StaticEntitlements::new().with(
        "u-pro",
        Entitlement {
            plan: Plan::Pro,
            status: SubscriptionStatus::Active,
        },
    );
    let service = ExtractionService::builder(config)
        .backend(Arc::new(ScriptedBackend::new()))
        .entitlements(Arc::new(entitlements))
        .build()
        .unwrap();

    let pro = CallerIdentity::user("u-pro");
    for _ in 0..3 {
        service.create_session(png_request(false), &pro).await.unwrap();
    }
    let usage = service.usage(&pro).await.unwrap();
    assert!(usage.privileged);
    assert!(usage.allowed);
    assert_eq!(usage.limit, None);

    let free = CallerIdentity::user("u-free");
    service.create_session(png_request(false), &free).await.unwrap();
    let err = service
        .create_session(png_request(false), &free)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UsageLimit);
}

// ── Upload validation ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pdf_with_javascript_rejected() {
    let h = harness(ScriptedBackend::new(), |b| b);

    let err = h
        .service
        .create_session(
            request("invoice.pdf", "application/pdf", &pdf_bytes(1, true), true),
            &caller(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UploadInvalid(UploadRejection::EmbeddedScript { .. })
    ));
    assert_eq!(err.http_status(), 400);
    assert!(h.blobs.is_empty());
}

#[tokio::test]
async fn test_unsupported_type_rejected_before_content_checks() {
    let h = harness(ScriptedBackend::new(), |b| b);

    let err = h
        .service
        .create_session(
            request("notes.txt", "text/plain", b"hello", false),
            &caller(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UploadInvalid(UploadRejection::UnsupportedType { .. })
    ));
}

#[tokio::test]
async fn test_declared_type_must_match_data_url() {
    let h = harness(ScriptedBackend::new(), |b| b);

    let mut req = png_request(false);
    req.file_type = "application/pdf".into();
    let err = h.service.create_session(req, &caller()).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UploadInvalid(UploadRejection::TypeMismatch { .. })
    ));
}

#[tokio::test]
async fn test_too_many_pages_rejected() {
    let h = harness(ScriptedBackend::new(), |b| b.max_pdf_pages(2));

    let err = h
        .service
        .create_session(pdf_request(3, false), &caller())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UploadInvalid(UploadRejection::TooManyPages {
            max_pages: 2,
            pages: 3
        })
    ));
}

#[tokio::test]
async fn test_existing_object_path_source() {
    let h = harness(
        ScriptedBackend::new().structured(ScriptStep::Reply(VALID_RESPONSE.into())),
        |b| b,
    );
    h.blobs
        .put("inbox/scan-001.png", png_bytes())
        .await
        .unwrap();

    let session = h
        .service
        .create_session(
            CreateSessionRequest {
                file_name: "scan-001.png".into(),
                file_type: "image/png".into(),
                file_size: 0,
                source: UploadSource::ObjectPath("inbox/scan-001.png".into()),
                delete_after_processing: true,
            },
            &caller(),
        )
        .await
        .unwrap();
    assert_eq!(session.object_path, "inbox/scan-001.png");

    let done = h.service.process_session(&session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(!h.blobs.contains("inbox/scan-001.png"));

    let err = h
        .service
        .create_session(
            CreateSessionRequest {
                file_name: "gone.png".into(),
                file_type: "image/png".into(),
                file_size: 0,
                source: UploadSource::ObjectPath("inbox/gone.png".into()),
                delete_after_processing: true,
            },
            &caller(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::UploadInvalid(UploadRejection::MissingObject { .. })
    ));
}

// ── Review ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_submit_review_completes_session() {
    let h = harness(
        ScriptedBackend::new()
            .structured(ScriptStep::Reply(r#"{"fields": []}"#.into()))
            .ocr(ScriptStep::Reply(OCR_TEXT.into())),
        |b| b,
    );

    let session = h.service.create_session(png_request(true), &caller()).await.unwrap();
    let review = h.service.process_session(&session.id).await.unwrap();
    assert_eq!(review.status, SessionStatus::NeedsReview);

    let done = h
        .service
        .submit_review(
            &session.id,
            vec![
                FieldCandidate::new("Invoice Number", Some("42")),
                FieldCandidate::new("Total", Some("119,00")),
                FieldCandidate::new("Due Date", None),
            ],
        )
        .await
        .unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.error_code.is_none());
    assert_eq!(done.ocr_text.as_deref(), Some(OCR_TEXT));
    let data = done.extracted.unwrap();
    assert_eq!(data.fields.len(), 3);
    assert!(data.field("Due Date").unwrap().confidence < 0.5);

    // Only a needs_review session accepts a review.
    let err = h
        .service
        .submit_review(&session.id, vec![FieldCandidate::new("Total", Some("1"))])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let h = harness(ScriptedBackend::new(), |b| b);

    let err = h.service.process_session("missing").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(err.http_status(), 404);
}

// ── Durable backend ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sqlite_and_filesystem_backends() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::open(&StoreBackend::Sqlite(dir.path().join("invoice.db"))).unwrap();
    let blobs = Arc::new(FsBlobStore::new(dir.path().join("blobs")));
    let backend = Arc::new(
        ScriptedBackend::new()
            .structured(ScriptStep::Reply(VALID_RESPONSE.into()))
            .structured(ScriptStep::Reply("{}".into()))
            .ocr(ScriptStep::Reply(OCR_TEXT.into())),
    );
    let config = PipelineConfig::builder()
        .retry_backoff_ms(1)
        .daily_limit(2)
        .build()
        .unwrap();
    let service = ExtractionService::builder(config)
        .stores(stores)
        .blobs(blobs.clone())
        .backend(backend)
        .build()
        .unwrap();

    let first = service.create_session(png_request(true), &caller()).await.unwrap();
    assert!(blobs.get(&first.object_path).await.unwrap().is_some());
    let done = service.process_session(&first.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(blobs.get(&first.object_path).await.unwrap().is_none());
    assert_eq!(service.get_session(&first.id).await.unwrap(), done);

    let second = service.create_session(pdf_request(1, true), &caller()).await.unwrap();
    let review = service.process_session(&second.id).await.unwrap();
    assert_eq!(review.status, SessionStatus::NeedsReview);
    assert_eq!(review.ocr_text.as_deref(), Some(OCR_TEXT));

    let err = service
        .create_session(png_request(true), &caller())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UsageLimit);
}
