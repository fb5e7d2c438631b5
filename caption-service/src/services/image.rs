//! Upload validation and image decoding.

use crate::config::UploadConfig;
use crate::services::captioner::CaptionError;
use image::DynamicImage;
use service_core::error::AppError;

/// The `file` part of a `/predict` request.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// `image/PNG; q=0.9` -> `image/png`.
pub fn normalize_mime(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Checks the declared MIME type against the allow-list.
pub fn validate_mime(content_type: Option<&str>, config: &UploadConfig) -> Result<(), AppError> {
    if !config.validate {
        return Ok(());
    }

    let mime = content_type.map(normalize_mime).unwrap_or_default();
    if mime.is_empty() {
        return Err(AppError::UnsupportedMediaType(
            "Missing content type for uploaded file".to_string(),
        ));
    }

    if !config.allowed_mime_types.iter().any(|allowed| *allowed == mime) {
        return Err(AppError::UnsupportedMediaType(format!(
            "Unsupported content type {}; expected one of: {}",
            mime,
            config.allowed_mime_types.join(", ")
        )));
    }

    Ok(())
}

pub fn validate_size(size: usize, config: &UploadConfig) -> Result<(), AppError> {
    if config.validate && size > config.max_bytes {
        return Err(AppError::PayloadTooLarge(format!(
            "File too large ({} bytes, max {} bytes)",
            size, config.max_bytes
        )));
    }

    Ok(())
}

/// Decodes with the format sniffed from the bytes, ignoring the declared type.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage, CaptionError> {
    if data.is_empty() {
        return Err(CaptionError::Decode("empty file".to_string()));
    }

    image::load_from_memory(data).map_err(|e| CaptionError::Decode(e.to_string()))
}
