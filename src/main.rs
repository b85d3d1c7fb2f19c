use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use wallpaper_stats::{
    clock::SystemClock, router, AppState, Config, FileStore, MemoryStore, StatsCache,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env();
    let durable = FileStore::open(config.data_path.clone()).await;
    info!(
        path = %durable.path().display(),
        ttl_secs = config.ttl.as_secs(),
        "opened stats cache"
    );

    // The session tier lives only as long as the process.
    let cache = StatsCache::with_ttl(
        Box::new(durable),
        Box::new(MemoryStore::new()),
        Arc::new(SystemClock),
        config.ttl,
    );
    let app = router(AppState::new(cache));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
    }
    info!("shutting down");
}
