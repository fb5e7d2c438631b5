//! Mock captioner for testing.

use super::{CaptionError, Captioner};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};

pub struct MockCaptioner {
    enabled: bool,
}

impl MockCaptioner {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl Captioner for MockCaptioner {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn caption(&self, image: DynamicImage) -> Result<String, CaptionError> {
        if !self.enabled {
            return Err(CaptionError::NotConfigured(
                "Mock captioner not enabled".to_string(),
            ));
        }

        let (width, height) = image.dimensions();
        Ok(format!("a {}x{} test image", width, height))
    }

    async fn health_check(&self) -> Result<(), CaptionError> {
        if self.enabled {
            Ok(())
        } else {
            Err(CaptionError::NotConfigured(
                "Mock captioner not enabled".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn describes_image_dimensions() {
        let captioner = MockCaptioner::new(true);
        let caption = captioner
            .caption(DynamicImage::new_rgb8(32, 16))
            .await
            .unwrap();

        assert_eq!(caption, "a 32x16 test image");
        assert!(captioner.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn disabled_captioner_fails_every_call() {
        let captioner = MockCaptioner::new(false);

        assert!(matches!(
            captioner.caption(DynamicImage::new_rgb8(1, 1)).await,
            Err(CaptionError::NotConfigured(_))
        ));
        assert!(captioner.health_check().await.is_err());
    }
}
