use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use tracing::{error, info};

use swamp::api::{create_router, AppState};
use swamp::config::Config;
use swamp::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let engine_config = config.engine_config().context("Invalid engine configuration")?;
    let engine = Engine::start(engine_config).await.context("Failed to start engine")?;
    info!("Engine started with jobs {:?}", engine.job_ids());

    if config.api.token.is_none() {
        info!("SWAMP_API_TOKEN is not set; query and load endpoints reject every request");
    }

    let state = AppState {
        engine: engine.clone(),
        api_token: config.api.token.clone(),
    };
    let app: Router = create_router(state);

    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Shutting down");
    engine.shutdown().await?;

    Ok(())
}
