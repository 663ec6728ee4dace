//! PDF rasterisation: render every page of an uploaded PDF via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking pool so the
//! Tokio workers keep serving other sessions while a page renders.
//!
//! ## Why cap pixels, not DPI?
//!
//! Invoice PDFs range from phone-scanned receipts to A3 statements. Capping
//! the longest edge keeps memory bounded and matches the image-size sweet
//! spot of hosted vision models (around 1,024–2,048 px).

use crate::error::InferenceError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use tracing::{debug, info};

/// Rasterise all pages of `pdf` (at most `max_pages`).
pub async fn render_pdf(
    pdf: Vec<u8>,
    max_pixels: u32,
    max_pages: usize,
) -> Result<Vec<DynamicImage>, InferenceError> {
    tokio::task::spawn_blocking(move || render_pdf_blocking(&pdf, max_pixels, max_pages))
        .await
        .map_err(|e| InferenceError::FileHandle {
            detail: format!("render task panicked: {e}"),
        })?
}

fn render_pdf_blocking(
    pdf: &[u8],
    max_pixels: u32,
    max_pages: usize,
) -> Result<Vec<DynamicImage>, InferenceError> {
    let pdfium = pdfium_auto::bind_pdfium_available().map_err(|e| InferenceError::FileHandle {
        detail: format!("pdfium library unavailable: {e}"),
    })?;

    let document = pdfium
        .load_pdf_from_byte_slice(pdf, None)
        .map_err(|e| InferenceError::FileHandle {
            detail: format!("pdfium could not open document: {e:?}"),
        })?;

    let pages = document.pages();
    info!("PDF loaded for rasterisation: {} pages", pages.len());

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut images = Vec::new();
    for (idx, page) in pages.iter().enumerate().take(max_pages) {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| InferenceError::FileHandle {
                detail: format!("page {} failed to render: {e:?}", idx + 1),
            })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    if images.is_empty() {
        return Err(InferenceError::FileHandle {
            detail: "document rendered no pages".into(),
        });
    }
    Ok(images)
}
