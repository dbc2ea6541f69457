mod config;
mod downstream;
mod error;
mod event;
mod listener;
mod router;
mod session;
mod store;
mod upstream;

use std::sync::Arc;

use anyhow::Context;

use config::ServerConfig;
use listener::ConnectionListener;
use router::RoutingEngine;
use store::SubscriptionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("loading configuration")?;
    init_tracing(&config).context("initializing logging")?;

    tracing::info!("burrow-server starting");

    let store = SubscriptionStore::open(&config.db_name, &config.db_key)
        .context("opening subscription store")?;
    let router = Arc::new(RoutingEngine::new(store));

    let listener = ConnectionListener::new(config, router);
    listener.run().await.context("connection listener failed")?;
    Ok(())
}

fn init_tracing(config: &ServerConfig) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_path.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    }

    rotate_log_if_oversized(&config.log_path, config.log_max_bytes)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)
        .with_context(|| format!("opening log file {}", config.log_path))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// One-shot rotation: an oversized log is moved aside at startup.
fn rotate_log_if_oversized(path: &str, max_bytes: u64) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > max_bytes => std::fs::rename(path, format!("{path}.old")),
        _ => Ok(()),
    }
}
