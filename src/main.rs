use message_ingest::app::ApplicationContext;
use message_ingest::config::{AppConfig, DEFAULT_CONFIG_PATH};
use message_ingest::telemetry;
use message_ingest::utils::shutdown_channel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config path can be overridden with APP_CONFIG
    // Example: APP_CONFIG=/etc/ingest/application.yaml message-ingest
    let path = std::env::var("APP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load(&path)?;

    telemetry::init(&config.log)?;
    tracing::info!(name = %config.server.name, config = %path, "🚀 Starting message ingest service");

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("🛑 Shutdown signal received");
        trigger.trigger();
    });

    let app = ApplicationContext::new(config).await?;
    app.run(shutdown).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
