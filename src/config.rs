//! Configuration types for the extraction pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share a config across request handlers, log it at startup, and
//! diff two deployments to understand why their outcomes differ.
//!
//! # Design choice: builder over constructor
//! A twenty-field constructor is unreadable and breaks on every new field.
//! The builder pattern lets callers set only what they care about and rely on
//! well-documented defaults for the rest.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use crate::upload::{DocumentKind, UploadPolicy};
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the extraction pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_invoice::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .daily_limit(5)
///     .max_retries(2)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Upload size ceiling in bytes. Default: 10 MiB.
    pub max_upload_bytes: u64,

    /// Maximum pages accepted in a PDF upload. Default: 20.
    ///
    /// Applied independently of byte size: a 200 KB PDF with 400 pages is
    /// still rejected, since cost scales with pages, not bytes.
    pub max_pdf_pages: usize,

    /// Accepted document kinds. Default: PDF, JPEG, PNG.
    pub allowed_types: Vec<DocumentKind>,

    /// Uploads per scope per UTC day for non-privileged callers. Default: 3.
    pub daily_limit: u32,

    /// Salt mixed into client IPs before hashing them into a quota scope.
    pub ip_hash_salt: String,

    /// LLM model identifier, e.g. "gpt-4.1-mini", "gemini-2.0-flash".
    /// If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini", "anthropic").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    ///
    /// Extraction is transcription, not composition: any creativity here
    /// shows up as invented invoice numbers.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 4096.
    pub max_tokens: usize,

    /// Retries after the first attempt on a transient failure. Default: 2.
    ///
    /// Timeouts, 429s and 5xx are retried; malformed output never is,
    /// because the same prompt reproduces the same malformed answer.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s.
    pub retry_backoff_ms: u64,

    /// Hard per-call deadline in seconds. Default: 60.
    ///
    /// When it elapses the in-flight request future is dropped, which
    /// closes the connection instead of holding it open.
    pub api_timeout_secs: u64,

    /// Custom structured-extraction instruction. If None, uses the built-in one.
    pub extraction_prompt: Option<String>,

    /// Custom OCR-fallback instruction. If None, uses the built-in one.
    pub ocr_prompt: Option<String>,

    /// Lifetime of a kept upload before the sweep deletes it. Default: 3600.
    pub upload_ttl_secs: u64,

    /// Lifetime of session metadata before the sweep deletes it. Default: 86400.
    pub session_ttl_secs: u64,

    /// Longest edge, in pixels, of a rasterised PDF page. Default: 2000.
    pub render_max_pixels: u32,

    /// Optional per-session progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            max_pdf_pages: 20,
            allowed_types: vec![DocumentKind::Pdf, DocumentKind::Jpeg, DocumentKind::Png],
            daily_limit: 3,
            ip_hash_salt: String::from("edgequake-invoice"),
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            extraction_prompt: None,
            ocr_prompt: None,
            upload_ttl_secs: 3600,
            session_ttl_secs: 86_400,
            render_max_pixels: 2000,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("max_pdf_pages", &self.max_pdf_pages)
            .field("allowed_types", &self.allowed_types)
            .field("daily_limit", &self.daily_limit)
            .field("ip_hash_salt", &"<redacted>")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("upload_ttl_secs", &self.upload_ttl_secs)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The validator limits derived from this config.
    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            allowed_types: self.allowed_types.clone(),
            max_bytes: self.max_upload_bytes,
            max_pdf_pages: self.max_pdf_pages,
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-indexed).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    /// Upper bound on one processing run: the file upload, then the
    /// structured call and the OCR fallback with every retry. A session
    /// still `processing` after this long belongs to an abandoned run.
    pub fn max_run_duration(&self) -> Duration {
        let timeout = self.api_timeout();
        let waits: Duration = (1..=self.max_retries)
            .map(|attempt| self.backoff_for(attempt).max(timeout))
            .sum();
        let per_call = timeout.saturating_mul(self.max_retries.saturating_add(1)) + waits;
        timeout + per_call.saturating_mul(2)
    }

    pub fn upload_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.upload_ttl_secs as i64)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn max_pdf_pages(mut self, pages: usize) -> Self {
        self.config.max_pdf_pages = pages;
        self
    }

    pub fn allowed_types(mut self, kinds: Vec<DocumentKind>) -> Self {
        self.config.allowed_types = kinds;
        self
    }

    pub fn daily_limit(mut self, n: u32) -> Self {
        self.config.daily_limit = n;
        self
    }

    pub fn ip_hash_salt(mut self, salt: impl Into<String>) -> Self {
        self.config.ip_hash_salt = salt.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn extraction_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.extraction_prompt = Some(prompt.into());
        self
    }

    pub fn ocr_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.ocr_prompt = Some(prompt.into());
        self
    }

    pub fn upload_ttl_secs(mut self, secs: u64) -> Self {
        self.config.upload_ttl_secs = secs;
        self
    }

    pub fn session_ttl_secs(mut self, secs: u64) -> Self {
        self.config.session_ttl_secs = secs;
        self
    }

    pub fn render_max_pixels(mut self, px: u32) -> Self {
        self.config.render_max_pixels = px.max(100);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_upload_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_upload_bytes must be > 0".into(),
            ));
        }
        if c.max_pdf_pages == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_pdf_pages must be ≥ 1".into(),
            ));
        }
        if c.allowed_types.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one document type must be allowed".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.ip_hash_salt.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "ip_hash_salt must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
