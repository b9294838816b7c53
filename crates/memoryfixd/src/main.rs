use anyhow::Result;
use memoryfixd::config::DaemonConfig;
use memoryfixd::{router, Engine};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("memoryfixd starting");

    let config = DaemonConfig::from_env()?;
    let engine = Arc::new(Engine::new(config.core));
    engine.spawn_sweeper();
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "memoryfixd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("memoryfixd shutting down");
    Ok(())
}
