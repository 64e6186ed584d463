//! Media Relay Server
//!
//! Loads configuration, sets up logging, wires the relay pipeline and serves HTTP.

use anyhow::Context;
use media_relay::{
    MediaResolver, RelayConfig, RelayMetrics, RelayServer, ResourceStore, StreamRelay,
    TieredCache, YtDlpExtractor,
};
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/media_relay.yaml";

/// Main entry point for the media relay
///
/// # Usage
/// ```bash
/// # Start with config/media_relay.yaml if present, defaults otherwise
/// media-relay
///
/// # Start with custom config
/// media-relay /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Media Relay Server");

    let config = load_config(env::args().nth(1))?;
    info!("Configuration loaded successfully");
    info!("  - Listen address: {}", config.listen_address);
    info!(
        "  - Primary cache: {}",
        config.cache.redis_url.as_deref().unwrap_or("none")
    );
    info!("  - Stream URL TTL: {} seconds", config.cache.stream_url_ttl);
    info!("  - Extractor: {}", config.extractor.program);
    info!("  - Upstream timeout: {} seconds", config.upstream.timeout_secs);
    info!("  - Chunk size: {} bytes", config.upstream.chunk_size);

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .context("invalid listen address")?;

    let metrics = Arc::new(RelayMetrics::new().context("failed to register metrics")?);
    let cache = Arc::new(TieredCache::from_config(&config.cache));
    let status = cache.warm_up().await;
    info!("Cache tier: {}", status.describe());

    let resources = Arc::new(ResourceStore::new(
        &config.upstream,
        YtDlpExtractor::factory(&config.extractor),
    ));
    let resolver = Arc::new(MediaResolver::new(
        Arc::clone(&cache),
        Arc::clone(&resources),
        Arc::clone(&metrics),
        &config.extractor,
        config.cache.stream_url_ttl(),
    ));
    let relay = Arc::new(StreamRelay::new(
        resolver,
        resources,
        Arc::clone(&metrics),
        &config.upstream,
    ));

    RelayServer::new(relay, cache, metrics)
        .start(addr)
        .await
        .context("server stopped")?;
    Ok(())
}

fn load_config(path: Option<String>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            RelayConfig::from_file(&path).with_context(|| format!("failed to load {}", path))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from: {}", DEFAULT_CONFIG_PATH);
            RelayConfig::from_file(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("failed to load {}", DEFAULT_CONFIG_PATH))
        }
        None => {
            info!("No configuration file, using defaults");
            let mut config = RelayConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}
