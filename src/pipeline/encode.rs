//! Image encoding: page image file → base64 data URL.
//!
//! Chat-completions APIs accept images inline as
//! `data:<mime>;base64,<payload>` inside the JSON request body, so no upload
//! step is needed.

use crate::config::ImageFormat;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;
use tracing::debug;

/// A page image ready to be embedded in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: &'static str,
    pub base64: String,
}

impl EncodedImage {
    /// `data:` URL form used in `image_url` content parts.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// Read an image file and base64-encode it.
///
/// The MIME type is taken from the file extension; unknown extensions are
/// sent as JPEG, which is what the default rasterizer writes.
pub async fn encode_image_file(path: &Path) -> std::io::Result<EncodedImage> {
    let bytes = tokio::fs::read(path).await?;
    Ok(encode_bytes(&bytes, mime_for(path)))
}

/// Base64-encode raw image bytes.
pub fn encode_bytes(bytes: &[u8], mime_type: &'static str) -> EncodedImage {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", b64.len());
    EncodedImage {
        mime_type,
        base64: b64,
    }
}

fn mime_for(path: &Path) -> &'static str {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(ImageFormat::from_extension)
        .unwrap_or(ImageFormat::Jpeg)
        .mime_type()
}
