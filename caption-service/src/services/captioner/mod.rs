//! Captioning backends.
//!
//! The pretrained network is treated as an external capability behind the
//! [`Captioner`] trait, so handlers never see candle types and tests can run
//! against [`mock::MockCaptioner`] without downloading weights.

pub mod blip;
pub mod mock;

use crate::config::{ModelBackend, ModelConfig};
use async_trait::async_trait;
use image::DynamicImage;
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;

pub use blip::BlipCaptioner;
pub use mock::MockCaptioner;

/// Error type for captioning operations.
#[derive(Error, Debug)]
pub enum CaptionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Captioner not configured: {0}")]
    NotConfigured(String),
}

impl From<candle_core::Error> for CaptionError {
    fn from(err: candle_core::Error) -> Self {
        CaptionError::Inference(err.to_string())
    }
}

impl From<CaptionError> for AppError {
    fn from(err: CaptionError) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

/// An image-to-text model.
#[async_trait]
pub trait Captioner: Send + Sync {
    /// Identifier reported by `/health` and used as a metrics label.
    fn model_name(&self) -> &str;

    /// Generate a caption for an already decoded image.
    async fn caption(&self, image: DynamicImage) -> Result<String, CaptionError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), CaptionError>;
}

/// Build the backend selected by `config.backend`.
///
/// For BLIP this downloads (or reads) weights and tokenizer and loads the
/// network, which can take a while on first start.
pub async fn build_captioner(config: &ModelConfig) -> Result<Arc<dyn Captioner>, CaptionError> {
    match config.backend {
        ModelBackend::Blip => Ok(Arc::new(BlipCaptioner::load(config).await?)),
        ModelBackend::Mock => Ok(Arc::new(MockCaptioner::new(true))),
    }
}
