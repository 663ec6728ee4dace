//! Production [`InferenceBackend`] over an `edgequake-llm` vision provider.
//!
//! Chat-completion providers have no file API, so "uploading" a PDF means
//! rasterising its pages once and parking the encoded images under a
//! generated handle. `generate` attaches those images to the request;
//! `delete_file` drops them. The orchestrator's release-on-every-path
//! contract therefore also bounds how long rendered pages stay in memory.

use crate::config::PipelineConfig;
use crate::error::{InferenceError, PipelineError};
use crate::pipeline::backend::{DocumentPayload, FileHandle, InferenceBackend, InferenceRequest};
use crate::pipeline::{encode, render};
use crate::upload::DocumentKind;
use async_trait::async_trait;
use edgequake_llm::{
    ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError, ProviderFactory,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_MODEL: &str = "gpt-4.1-mini";

pub struct VisionLlmBackend {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    render_max_pixels: u32,
    max_pages: usize,
    files: Mutex<HashMap<String, Vec<ImageData>>>,
}

impl VisionLlmBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
            render_max_pixels: config.render_max_pixels,
            max_pages: config.max_pdf_pages,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the provider from `config` and wrap it.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(resolve_provider(config)?, config))
    }

    /// Number of uploaded documents not yet released.
    pub fn open_files(&self) -> usize {
        self.files.lock().map(|f| f.len()).unwrap_or(0)
    }

    fn files(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<ImageData>>>, InferenceError> {
        self.files.lock().map_err(|_| InferenceError::FileHandle {
            detail: "file table lock poisoned".into(),
        })
    }
}

fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl InferenceBackend for VisionLlmBackend {
    async fn upload_file(
        &self,
        bytes: &[u8],
        kind: DocumentKind,
    ) -> Result<FileHandle, InferenceError> {
        let images = if kind == DocumentKind::Pdf {
            let pages =
                render::render_pdf(bytes.to_vec(), self.render_max_pixels, self.max_pages).await?;
            pages
                .iter()
                .map(encode::encode_page)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| InferenceError::FileHandle {
                    detail: format!("page encoding failed: {e}"),
                })?
        } else {
            vec![encode::inline_image(
                &encode::encode_inline(bytes),
                kind.mime_type(),
            )]
        };

        let handle = FileHandle {
            id: Uuid::new_v4().to_string(),
            mime_type: kind.mime_type().to_string(),
        };
        debug!("Staged {} image(s) under handle {}", images.len(), handle.id);
        self.files()?.insert(handle.id.clone(), images);
        Ok(handle)
    }

    async fn delete_file(&self, handle: &FileHandle) -> Result<(), InferenceError> {
        self.files()?.remove(&handle.id);
        Ok(())
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let images = match &request.payload {
            DocumentPayload::Inline { kind, base64 } => {
                vec![encode::inline_image(base64, kind.mime_type())]
            }
            DocumentPayload::File(handle) => self
                .files()?
                .get(&handle.id)
                .cloned()
                .ok_or_else(|| InferenceError::FileHandle {
                    detail: format!("unknown or released file handle {}", handle.id),
                })?,
        };

        // The image carries the document; the instruction rides in the system turn.
        let messages = vec![
            ChatMessage::system(request.instruction.as_str()),
            ChatMessage::user_with_images("", images),
        ];

        let start = Instant::now();
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_provider_error(&e))?;

        debug!(
            "{} call: {} input tokens, {} output tokens, {:?}",
            request.kind,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        if response.content.trim().is_empty() {
            return Err(InferenceError::Malformed {
                detail: "provider returned an empty message".into(),
            });
        }
        Ok(response.content)
    }
}

static RE_RETRY_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry[- ]after[^0-9]{0,8}(\d+)").unwrap());

/// An HTTP status at the start of the message or right after `HTTP`,
/// `status`, `code` or `error`. Bare numbers elsewhere (token counts,
/// limits) do not count.
static RE_HTTP_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^\W{0,2}|\b(?:http|status|code|error)\W{0,3})(\d{3})\b").unwrap()
});

/// Map a provider error onto the retry taxonomy.
pub fn classify_provider_error(err: &LlmError) -> InferenceError {
    match err {
        LlmError::RateLimited(message) => InferenceError::RateLimited {
            retry_after_secs: retry_after(message),
        },
        LlmError::Timeout => InferenceError::Timeout { elapsed_ms: 0 },
        LlmError::NetworkError(_) => InferenceError::Server {
            message: err.to_string(),
        },
        LlmError::SerializationError(e) => InferenceError::Malformed {
            detail: e.to_string(),
        },
        LlmError::ApiError(message)
        | LlmError::ProviderError(message)
        | LlmError::Unknown(message) => classify_by_status(message, err.to_string()),
        LlmError::AuthError(_)
        | LlmError::InvalidRequest(_)
        | LlmError::TokenLimitExceeded { .. }
        | LlmError::ModelNotFound(_)
        | LlmError::ConfigError(_)
        | LlmError::NotSupported(_) => InferenceError::Rejected {
            message: err.to_string(),
        },
    }
}

/// Fallback for variants that only carry the provider's text.
fn classify_by_status(message: &str, display: String) -> InferenceError {
    let status = RE_HTTP_STATUS
        .captures(message)
        .and_then(|c| c[1].parse::<u16>().ok());
    match status {
        Some(429) => InferenceError::RateLimited {
            retry_after_secs: retry_after(message),
        },
        Some(408) | Some(504) => InferenceError::Timeout { elapsed_ms: 0 },
        Some(500..=599) => InferenceError::Server { message: display },
        _ => InferenceError::Rejected { message: display },
    }
}

fn retry_after(message: &str) -> Option<u64> {
    RE_RETRY_AFTER
        .captures(message)
        .and_then(|c| c[1].parse().ok())
}

/// Instantiate a named provider with the given model.
fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`)
/// 2. **Provider name + model** (`config.provider_name`)
/// 3. **`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`**, when both are set
/// 4. **`OPENAI_API_KEY`**: OpenAI wins when several keys are present
/// 5. **Full auto-detection** (`ProviderFactory::from_env`)
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::progress::CallKind;

    #[test]
    fn build_options_use_config() {
        let config = PipelineConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[test]
    fn classifies_rate_limit_with_retry_after() {
        let e = classify_provider_error(&LlmError::RateLimited(
            "Too Many Requests: retry-after: 12".into(),
        ));
        assert_eq!(
            e,
            InferenceError::RateLimited {
                retry_after_secs: Some(12)
            }
        );

        let from_status = classify_provider_error(&LlmError::ApiError(
            "HTTP 429 Too Many Requests".into(),
        ));
        assert!(matches!(from_status, InferenceError::RateLimited { .. }));
    }

    #[test]
    fn classifies_by_variant() {
        assert!(classify_provider_error(&LlmError::Timeout).is_transient());
        assert!(
            classify_provider_error(&LlmError::NetworkError("connection reset".into()))
                .is_transient()
        );
        assert!(classify_provider_error(&LlmError::ProviderError("503 model overloaded".into()))
            .is_transient());

        let auth = classify_provider_error(&LlmError::AuthError("invalid api key".into()));
        assert!(matches!(auth, InferenceError::Rejected { .. }));
        let limit = classify_provider_error(&LlmError::TokenLimitExceeded {
            max: 2500,
            got: 4096,
        });
        assert!(!limit.is_transient());

        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let malformed = classify_provider_error(&LlmError::SerializationError(bad_json));
        assert!(matches!(malformed, InferenceError::Malformed { .. }));
    }

    #[test]
    fn numbers_in_text_are_not_status_codes() {
        let e = classify_provider_error(&LlmError::ApiError(
            "invalid_request_error: max_tokens 4096 exceeds model limit 2500".into(),
        ));
        assert!(matches!(e, InferenceError::Rejected { .. }));
        assert!(!e.is_transient());

        let e = classify_provider_error(&LlmError::ApiError(
            "image too large: 5000 pixels wide, 503 rows".into(),
        ));
        assert!(!e.is_transient());

        assert!(
            classify_provider_error(&LlmError::ApiError("status 502: bad gateway".into()))
                .is_transient()
        );
        assert!(
            classify_provider_error(&LlmError::ApiError("500 Internal Server Error".into()))
                .is_transient()
        );
    }

    #[tokio::test]
    async fn staged_images_are_released_on_delete() {
        let mock = Arc::new(edgequake_llm::MockProvider::new());
        mock.add_response("{\"fields\": []}").await;
        let backend = VisionLlmBackend::new(mock, &PipelineConfig::default());

        let handle = backend
            .upload_file(b"\x89PNG\r\n\x1a\n", DocumentKind::Png)
            .await
            .unwrap();
        assert_eq!(backend.open_files(), 1);

        let request = InferenceRequest {
            instruction: "extract".into(),
            payload: DocumentPayload::File(handle.clone()),
            kind: CallKind::Structured,
        };
        assert_eq!(backend.generate(&request).await.unwrap(), "{\"fields\": []}");

        backend.delete_file(&handle).await.unwrap();
        assert_eq!(backend.open_files(), 0);
        let gone = backend.generate(&request).await.unwrap_err();
        assert!(matches!(gone, InferenceError::FileHandle { .. }));
    }

    #[tokio::test]
    async fn empty_reply_is_malformed() {
        let mock = Arc::new(edgequake_llm::MockProvider::new());
        mock.add_response("  ").await;
        let backend = VisionLlmBackend::new(mock, &PipelineConfig::default());
        let request = InferenceRequest {
            instruction: "extract".into(),
            payload: DocumentPayload::Inline {
                kind: DocumentKind::Png,
                base64: "iVBORw0KGgo=".into(),
            },
            kind: CallKind::Structured,
        };
        let err = backend.generate(&request).await.unwrap_err();
        assert!(matches!(err, InferenceError::Malformed { .. }));
        assert_eq!(err.structured_code(), ErrorCode::ParseFail);
    }
}
