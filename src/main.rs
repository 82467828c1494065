mod config;
mod gemini;
mod models;
mod orchestrator;
mod progress;
mod prompt;
mod routes;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::gemini::GeminiClient;
use crate::orchestrator::{BatchOrchestrator, TokioClock};
use crate::routes::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env();
    match &config.api_key {
        Some(key) => tracing::info!("Fast tier key: {}", AppConfig::key_hint(key)),
        None => tracing::warn!("GEMINI_API_KEY not set; fast-tier requests must carry their own api_key"),
    }
    if config.pro_api_key.is_none() {
        tracing::info!("GEMINI_PRO_API_KEY not set; high-quality tier needs a per-request api_key");
    }

    let gemini = GeminiClient::new(config.api_base.clone(), config.request_timeout)
        .context("building Gemini HTTP client")?;
    let orchestrator = BatchOrchestrator::new(Arc::new(gemini), Arc::new(TokioClock), config.batch.clone());
    tracing::info!(settings = ?orchestrator.settings(), "Batch pacing configured");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(orchestrator, config));

    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
