use crate::services::captioner::CaptionError;
use crate::services::image::{decode_image, validate_mime, validate_size, Upload};
use crate::services::metrics::{self, CaptionOutcome};
use crate::startup::AppState;
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::time::Instant;

/// Multipart field carrying the image.
pub const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize, Deserialize)]
pub struct CaptionResponse {
    pub description: String,
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(format!("Request body too large: {}", err.body_text()))
    } else {
        AppError::BadRequest(anyhow::anyhow!(
            "Failed to read multipart field: {}",
            err.body_text()
        ))
    }
}

/// Reads the `file` part, rejecting a bad MIME type before its bytes are read.
async fn read_upload(state: &AppState, multipart: &mut Multipart) -> Result<Upload, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);

        validate_mime(content_type.as_deref(), &state.config.upload)?;

        let data = field.bytes().await.map_err(multipart_error)?.to_vec();
        validate_size(data.len(), &state.config.upload)?;

        return Ok(Upload {
            file_name,
            content_type,
            data,
        });
    }

    Err(AppError::BadRequest(anyhow::anyhow!("No file uploaded")))
}

pub async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let model = state.captioner.model_name().to_string();

    let upload = read_upload(&state, &mut multipart).await.map_err(|e| {
        tracing::warn!(error = %e, "Rejected caption upload");
        metrics::record_request(&model, CaptionOutcome::Rejected);
        e
    })?;

    metrics::record_upload_size(upload.data.len());
    tracing::info!(
        filename = upload.file_name.as_deref().unwrap_or("unnamed"),
        content_type = upload.content_type.as_deref().unwrap_or("unknown"),
        size = upload.data.len(),
        "Caption request received"
    );

    let image = tokio::task::spawn_blocking(move || decode_image(&upload.data))
        .await
        .map_err(|e| CaptionError::Decode(format!("Decode task failed: {}", e)))
        .and_then(|result| result)
        .map_err(|e| {
            tracing::warn!(error = %e, "Uploaded file is not a decodable image");
            metrics::record_request(&model, CaptionOutcome::DecodeError);
            AppError::from(e)
        })?;

    let start = Instant::now();
    let description = state.captioner.caption(image).await.map_err(|e| {
        tracing::error!(error = %e, model = %model, "Caption generation failed");
        metrics::record_request(&model, CaptionOutcome::InferenceError);
        AppError::from(e)
    })?;
    let elapsed = start.elapsed();

    metrics::record_inference(&model, elapsed);
    metrics::record_request(&model, CaptionOutcome::Success);
    tracing::info!(
        model = %model,
        elapsed_ms = elapsed.as_millis() as u64,
        "Caption generated"
    );

    Ok(Json(CaptionResponse { description }))
}
