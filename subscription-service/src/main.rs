//! Subscription Service entry point.

use secrecy::ExposeSecret;
use subscription_service::config::SubscriptionConfig;
use subscription_service::services::metrics::init_metrics;
use subscription_service::startup::Application;

use service_core::observability::{LoggingOptions, init_tracing};
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = SubscriptionConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(&LoggingOptions {
        service_name: &config.service_name,
        log_level: &config.log_level,
        json: config.log_json,
        otlp_endpoint: config.otlp_endpoint.as_deref(),
    });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting subscription-service");

    init_metrics();

    // Secrets are reported as present/absent only.
    tracing::info!(
        service_name = %config.service_name,
        http_port = config.server.port,
        storage = ?config.storage.backend,
        cache = ?config.cache.backend,
        gateway_url = %config.gateway.base_url,
        gateway_key_set = !config.gateway.secret_key.expose_secret().is_empty(),
        webhook_secret_set = !config.webhook.secret.expose_secret().is_empty(),
        fallback_plan = ?config.entitlements.fallback_plan,
        scheduler_enabled = config.scheduler.enabled,
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    if let Err(e) = app.run_until_stopped(shutdown_signal()).await {
        tracing::error!(error = %e, "Application error");
        return Err(e);
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}
