use caption_service::config::{CaptionConfig, ModelBackend};
use caption_service::services::captioner::{Captioner, MockCaptioner};
use caption_service::startup::Application;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::sync::Arc;

/// Small upload limit so oversized-file tests stay cheap.
pub const TEST_MAX_UPLOAD_BYTES: usize = 16 * 1024;

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
}

pub fn test_config() -> CaptionConfig {
    std::env::set_var("CAPTION_BACKEND", "mock");

    let mut config = CaptionConfig::load().expect("Failed to load configuration");
    config.common.port = 0; // Random port for testing
    config.model.backend = ModelBackend::Mock;
    config.upload.max_bytes = TEST_MAX_UPLOAD_BYTES;
    config
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config(), Arc::new(MockCaptioner::new(true))).await
    }

    pub async fn spawn_with(config: CaptionConfig, captioner: Arc<dyn Captioner>) -> Self {
        let app = Application::build_with_captioner(config, captioner)
            .await
            .expect("Failed to build test application");

        Self::start(app).await
    }

    pub async fn start(app: Application) -> Self {
        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            client,
        }
    }

    pub async fn predict(&self, part: reqwest::multipart::Part) -> reqwest::Response {
        self.predict_form(reqwest::multipart::Form::new().part("file", part))
            .await
    }

    pub async fn predict_form(&self, form: reqwest::multipart::Form) -> reqwest::Response {
        self.client
            .post(format!("{}/predict", self.address))
            .multipart(form)
            .send()
            .await
            .expect("Failed to execute request")
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("Failed to encode PNG");
    buf
}

pub fn file_part(data: Vec<u8>, file_name: &str, mime: &str) -> reqwest::multipart::Part {
    reqwest::multipart::Part::bytes(data)
        .file_name(file_name.to_string())
        .mime_str(mime)
        .expect("Invalid MIME type")
}
