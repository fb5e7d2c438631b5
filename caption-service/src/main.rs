use caption_service::config::CaptionConfig;
use caption_service::services::init_metrics;
use caption_service::startup::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize metrics recorder (must be before any metrics are recorded)
    init_metrics();

    let config = CaptionConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        "caption-service",
        &config.common.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        backend = ?config.model.backend,
        variant = ?config.model.variant,
        max_upload_bytes = config.upload.max_bytes,
        validate_uploads = config.upload.validate,
        "Starting caption service"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to start caption service: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    app.run_until_stopped().await
}
