use livewire_core::EngineConfig;
use livewire_web::config::WebConfig;
use livewire_web::{build_dispatcher, router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting livewire server");

    let web_config = match WebConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load web configuration: {}", e);
            return Err(e);
        }
    };
    let engine_config = EngineConfig::load()?;
    tracing::info!(
        port = web_config.port,
        workers = engine_config.worker_count,
        queue_capacity = engine_config.queue_capacity,
        "Configuration loaded"
    );

    let dispatcher = Arc::new(build_dispatcher(engine_config, &web_config)?);
    dispatcher.start().await?;

    let app = router(AppState::new(Arc::clone(&dispatcher)));
    let addr = SocketAddr::from(([0, 0, 0, 0], web_config.port));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on ws://{}/ws", addr);

    let stopping = Arc::clone(&dispatcher);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            // closes every socket so upgraded connections do not hold the server open
            stopping.stop().await;
        })
        .await?;

    dispatcher.stop().await;
    tracing::info!("Server stopped");
    Ok(())
}
