//! Upload validation: decide whether untrusted bytes may enter the pipeline.
//!
//! Checks run cheapest-first and stop at the first failure:
//!
//! 1. declared MIME type is in the allow-list
//! 2. size (declared or actual, whichever is larger) is under the ceiling
//! 3. the sniffed byte signature agrees with the declared type
//! 4. PDFs only: page count under the maximum, no embedded script markers
//!
//! [`validate_upload`] is pure — it never touches storage — so the service
//! can run it inside `spawn_blocking` and tests can drive it directly.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use lopdf::{Document, Object};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Document formats the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Jpeg,
    Png,
}

impl DocumentKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "application/pdf",
            DocumentKind::Jpeg => "image/jpeg",
            DocumentKind::Png => "image/png",
        }
    }

    /// Map a declared MIME type onto a kind. `image/jpg` is a common alias.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "application/pdf" => Some(DocumentKind::Pdf),
            "image/jpeg" | "image/jpg" => Some(DocumentKind::Jpeg),
            "image/png" => Some(DocumentKind::Png),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, DocumentKind::Pdf)
    }
}

/// Limits applied by [`validate_upload`].
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPolicy {
    pub allowed_types: Vec<DocumentKind>,
    pub max_bytes: u64,
    pub max_pdf_pages: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_types: vec![DocumentKind::Pdf, DocumentKind::Jpeg, DocumentKind::Png],
            max_bytes: 10 * 1024 * 1024,
            max_pdf_pages: 20,
        }
    }
}

/// Why an upload was rejected. Serialised as the `details` of an
/// `UPLOAD_INVALID` error.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UploadRejection {
    #[error("file is empty")]
    Empty,

    #[error("unsupported file type '{declared}' (allowed: {})", .allowed.join(", "))]
    UnsupportedType { declared: String, allowed: Vec<String> },

    #[error("file is {actual} bytes, limit is {max_bytes}")]
    TooLarge { max_bytes: u64, actual: u64 },

    #[error("declared type '{declared}' does not match file contents ({})", .detected.as_deref().unwrap_or("unknown"))]
    TypeMismatch {
        declared: String,
        detected: Option<String>,
    },

    #[error("PDF has {pages} pages, limit is {max_pages}")]
    TooManyPages { max_pages: usize, pages: usize },

    #[error("PDF contains embedded script ({marker})")]
    EmbeddedScript { marker: String },

    #[error("PDF could not be parsed: {detail}")]
    UnreadablePdf { detail: String },

    #[error("malformed data URL: {detail}")]
    MalformedDataUrl { detail: String },

    #[error("uploaded object '{object_path}' does not exist")]
    MissingObject { object_path: String },
}

/// What the validator learned about an accepted upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub kind: DocumentKind,
    pub size: u64,
    /// Only set for PDFs.
    pub page_count: Option<usize>,
}

/// Validate an upload against `policy`.
pub fn validate_upload(
    bytes: &[u8],
    declared_mime: &str,
    declared_size: u64,
    policy: &UploadPolicy,
) -> Result<UploadInfo, UploadRejection> {
    // (a) allow-list
    let kind = DocumentKind::from_mime(declared_mime)
        .filter(|k| policy.allowed_types.contains(k))
        .ok_or_else(|| UploadRejection::UnsupportedType {
            declared: declared_mime.to_string(),
            allowed: policy
                .allowed_types
                .iter()
                .map(|k| k.mime_type().to_string())
                .collect(),
        })?;

    // (b) size ceiling
    let actual = bytes.len() as u64;
    let size = actual.max(declared_size);
    if size > policy.max_bytes {
        return Err(UploadRejection::TooLarge {
            max_bytes: policy.max_bytes,
            actual: size,
        });
    }
    if bytes.is_empty() {
        return Err(UploadRejection::Empty);
    }

    // (c) signature sniffing
    let detected = sniff(bytes);
    if detected != Some(kind) {
        return Err(UploadRejection::TypeMismatch {
            declared: declared_mime.to_string(),
            detected: infer::get(bytes).map(|t| t.mime_type().to_string()),
        });
    }

    // (d) PDF structure
    let page_count = if kind == DocumentKind::Pdf {
        Some(inspect_pdf(bytes, policy.max_pdf_pages)?)
    } else {
        None
    };

    debug!(
        "Upload accepted: {} ({} bytes, pages={:?})",
        kind.mime_type(),
        actual,
        page_count
    );

    Ok(UploadInfo {
        kind,
        size: actual,
        page_count,
    })
}

/// Detect the document kind from its magic bytes.
pub fn sniff(bytes: &[u8]) -> Option<DocumentKind> {
    infer::get(bytes).and_then(|t| DocumentKind::from_mime(t.mime_type()))
}

static RE_SCRIPT_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(JavaScript|JS)(?-u:\b)").expect("static regex"));

/// Count pages and look for script markers.
fn inspect_pdf(bytes: &[u8], max_pages: usize) -> Result<usize, UploadRejection> {
    let document = Document::load_mem(bytes).map_err(|e| UploadRejection::UnreadablePdf {
        detail: e.to_string(),
    })?;

    let pages = document.get_pages().len();
    if pages == 0 {
        return Err(UploadRejection::UnreadablePdf {
            detail: "document has no pages".into(),
        });
    }
    if pages > max_pages {
        return Err(UploadRejection::TooManyPages {
            max_pages,
            pages,
        });
    }

    // Raw scan catches uncompressed dictionaries; the object walk catches
    // keys that lived inside compressed object streams.
    if let Some(m) = RE_SCRIPT_MARKER.find(bytes) {
        return Err(UploadRejection::EmbeddedScript {
            marker: String::from_utf8_lossy(m.as_bytes()).into_owned(),
        });
    }
    for object in document.objects.values() {
        let dict = match object {
            Object::Dictionary(d) => d,
            Object::Stream(s) => &s.dict,
            _ => continue,
        };
        for key in ["JavaScript", "JS"] {
            if dict.has(key.as_bytes()) {
                return Err(UploadRejection::EmbeddedScript {
                    marker: format!("/{key}"),
                });
            }
        }
    }

    Ok(pages)
}

/// Split a `data:<mime>;base64,<payload>` URL into its MIME type and bytes.
pub fn decode_data_url(url: &str) -> Result<(String, Vec<u8>), UploadRejection> {
    let malformed = |detail: &str| UploadRejection::MalformedDataUrl {
        detail: detail.to_string(),
    };

    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| malformed("missing 'data:' prefix"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| malformed("missing ',' separator"))?;
    let mime = meta
        .strip_suffix(";base64")
        .ok_or_else(|| malformed("only base64 data URLs are supported"))?;

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| malformed(&e.to_string()))?;

    Ok((mime.to_string(), bytes))
}
