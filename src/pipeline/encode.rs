//! Image encoding for the multimodal request body.
//!
//! Rendered PDF pages are PNG-encoded (lossless: small print on invoices
//! does not survive JPEG artefacts). Uploaded images are passed through
//! as-is, since re-encoding a JPEG only loses detail.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as a base64 PNG.
///
/// `detail: "high"` lets GPT-4-class models tile the image instead of
/// downscaling it to a single overview tile, which loses line-item rows.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Wrap already-encoded image bytes.
pub fn encode_inline(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Build request image data from an inline base64 payload.
pub fn inline_image(base64: &str, mime_type: &str) -> ImageData {
    ImageData::new(base64.to_string(), mime_type).with_detail("high")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_page() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn inline_round_trips_bytes() {
        let b64 = encode_inline(&[0xFF, 0xD8, 0xFF]);
        let img = inline_image(&b64, "image/jpeg");
        assert_eq!(img.mime_type, "image/jpeg");
        assert_eq!(STANDARD.decode(&img.data).unwrap(), vec![0xFF, 0xD8, 0xFF]);
    }
}
