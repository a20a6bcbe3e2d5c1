use anyhow::{Context, Result};
use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};

use crate::types::{Frame, PixelOrder};

pub const BOUNDARY: &str = "frame";
/// `Content-Type` header value for an HTTP response carrying [`multipart_chunk`]s.
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let rgb = frame.clone().into_order(PixelOrder::Rgb);
    let mut jpeg = Vec::with_capacity(rgb.data().len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(rgb.data(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .with_context(|| format!("jpeg encode of {}x{} frame failed", rgb.width(), rgb.height()))?;
    Ok(jpeg)
}

/// Frames one JPEG as a multipart part: boundary, content type, blank line,
/// payload, trailing CRLF.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(jpeg.len() + 64);
    payload.extend_from_slice(b"--");
    payload.extend_from_slice(BOUNDARY.as_bytes());
    payload.extend_from_slice(b"\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    payload
}
