//! Configuration management for the media relay

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for the relay service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Address the HTTP front end binds to (default: 0.0.0.0:5001)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Tiered cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Format extractor settings
    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Origin connection settings
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Configuration for the tiered cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Primary store URL, e.g. `redis://127.0.0.1:6379`. Fallback-only when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Timeout applied to every primary store call in milliseconds (default: 500)
    #[serde(default = "default_primary_timeout_ms")]
    pub primary_timeout_ms: u64,

    /// Fallback map size above which expired entries are swept (default: 1000)
    #[serde(default = "default_cleanup_threshold")]
    pub fallback_cleanup_threshold: usize,

    /// TTL of resolved stream URLs in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_stream_url_ttl")]
    pub stream_url_ttl: u64,
}

/// Configuration for the external format extractor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractorConfig {
    /// Extractor executable (default: yt-dlp)
    #[serde(default = "default_extractor_program")]
    pub program: String,

    /// Format preference passed to the extractor
    #[serde(default = "default_format")]
    pub format: String,

    /// Client negotiation profiles, tried in order
    #[serde(default = "default_player_clients")]
    pub player_clients: Vec<String>,

    /// Prefix the media id is appended to in order to build the watch URL
    #[serde(default = "default_watch_url_base")]
    pub watch_url_base: String,

    /// Maximum time a single extraction may take, in seconds (default: 60)
    #[serde(default = "default_extractor_timeout")]
    pub timeout_secs: u64,
}

/// Configuration for origin connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Connect/read timeout in seconds (default: 30)
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    /// Size of chunks handed to the client in bytes (default: 8KB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Content-Type used when the origin does not send one
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Idle connections kept per origin host for each worker session (default: 10)
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            primary_timeout_ms: default_primary_timeout_ms(),
            fallback_cleanup_threshold: default_cleanup_threshold(),
            stream_url_ttl: default_stream_url_ttl(),
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            program: default_extractor_program(),
            format: default_format(),
            player_clients: default_player_clients(),
            watch_url_base: default_watch_url_base(),
            timeout_secs: default_extractor_timeout(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout(),
            chunk_size: default_chunk_size(),
            default_content_type: default_content_type(),
            pool_max_idle_per_host: default_pool_max_idle(),
        }
    }
}

impl CacheConfig {
    pub fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_timeout_ms)
    }

    pub fn stream_url_ttl(&self) -> Duration {
        Duration::from_secs(self.stream_url_ttl)
    }
}

impl ExtractorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Build the canonical watch URL for a media id
    pub fn watch_url(&self, media_id: &str) -> String {
        format!("{}{}", self.watch_url_base, media_id)
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_primary_timeout_ms() -> u64 {
    500
}

fn default_cleanup_threshold() -> usize {
    1000
}

fn default_stream_url_ttl() -> u64 {
    3600 // 1 hour
}

fn default_extractor_program() -> String {
    "yt-dlp".to_string()
}

fn default_format() -> String {
    "bestaudio[ext=m4a]/bestaudio[ext=webm]/bestaudio/best".to_string()
}

fn default_player_clients() -> Vec<String> {
    vec!["android".to_string(), "ios".to_string()]
}

fn default_watch_url_base() -> String {
    "https://www.youtube.com/watch?v=".to_string()
}

fn default_extractor_timeout() -> u64 {
    60
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    8192 // 8KB
}

fn default_content_type() -> String {
    "audio/webm".to_string()
}

fn default_pool_max_idle() -> usize {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_address: default_listen_address(),
            cache: CacheConfig::default(),
            extractor: ExtractorConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    ///
    /// Environment overrides are applied after parsing and before validation.
    ///
    /// # Returns
    /// * `Ok(RelayConfig)` if loading and validation succeed
    /// * `Err(RelayError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let mut config: RelayConfig = serde_yaml::from_str(&content).map_err(|e| {
            RelayError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override selected settings from the process environment
    ///
    /// - `REDIS_URL` sets the primary cache store
    /// - `RELAY_LISTEN_ADDRESS` sets the bind address
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            self.cache.redis_url = Some(url);
        }
        if let Some(addr) = lookup("RELAY_LISTEN_ADDRESS").filter(|v| !v.is_empty()) {
            self.listen_address = addr;
        }
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must parse as a socket address
    /// - chunk_size must be between 1KB and 1MB
    /// - timeouts and TTLs must be > 0
    /// - the extractor program and watch URL base must not be empty
    pub fn validate(&self) -> Result<()> {
        const MIN_CHUNK_SIZE: usize = 1024; // 1KB
        const MAX_CHUNK_SIZE: usize = 1024 * 1024; // 1MB

        self.listen_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                RelayError::ConfigError(format!(
                    "listen_address '{}' is not a valid socket address: {}",
                    self.listen_address, e
                ))
            })?;

        let chunk_size = self.upstream.chunk_size;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(RelayError::ConfigError(format!(
                "chunk_size must be between {}KB and {}MB, got {} bytes",
                MIN_CHUNK_SIZE / 1024,
                MAX_CHUNK_SIZE / (1024 * 1024),
                chunk_size
            )));
        }

        if self.upstream.timeout_secs == 0 {
            return Err(RelayError::ConfigError(
                "upstream timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.cache.stream_url_ttl == 0 {
            return Err(RelayError::ConfigError(
                "stream_url_ttl must be greater than 0".to_string(),
            ));
        }

        if self.cache.primary_timeout_ms == 0 {
            return Err(RelayError::ConfigError(
                "primary_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.cache.fallback_cleanup_threshold == 0 {
            return Err(RelayError::ConfigError(
                "fallback_cleanup_threshold must be greater than 0".to_string(),
            ));
        }

        if self.extractor.program.trim().is_empty() {
            return Err(RelayError::ConfigError(
                "extractor program must not be empty".to_string(),
            ));
        }

        if self.extractor.watch_url_base.trim().is_empty() {
            return Err(RelayError::ConfigError(
                "extractor watch_url_base must not be empty".to_string(),
            ));
        }

        if self.extractor.timeout_secs == 0 {
            return Err(RelayError::ConfigError(
                "extractor timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
