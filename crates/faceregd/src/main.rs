use anyhow::Result;
use facereg_core::OnnxExtractor;
use facereg_registry::{spawn_engine, FaceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        data_dir = %config.data_dir.display(),
        "faceregd starting"
    );

    // Without models nothing useful can be served.
    let extractor = OnnxExtractor::load(&config.model_dir)?;
    let engine = spawn_engine(Box::new(extractor))?;

    let shutdown = CancellationToken::new();
    let state = Arc::new(http::AppState {
        registry: FaceRegistry::new(config.registry_config(), engine),
        shutdown: shutdown.clone(),
        operation_timeout: Duration::from_secs(config.operation_timeout_secs),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "faceregd ready");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("faceregd shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
