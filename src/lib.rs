//! Media Relay
//!
//! Exposes recorded media, identified by an opaque media id, over HTTP. Each id
//! is resolved to a short-lived origin URL through an external extractor and the
//! origin's bytes are relayed back to the caller, honouring `Range` requests so
//! clients can seek and resume.
//!
//! # Architecture
//!
//! ```text
//! request ─► StreamRelay ─► MediaResolver ─► TieredCache (redis + memory)
//!                 │               └────────► ResourceStore ─► FormatExtractor
//!                 └──► origin host (per-worker reqwest client) ─► RelayBody ─► client
//! ```
//!
//! - [`TieredCache`]: networked primary store with an in-process fallback
//! - [`ResourceStore`]: per-worker HTTP client and extractor, built once
//! - [`MediaResolver`]: media id to origin URL, cache first
//! - [`StreamRelay`]: range-aware streaming from the origin
//! - [`RelayServer`]: HTTP/1 front end
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "0.0.0.0:5001"
//! cache:
//!   redis_url: "redis://127.0.0.1:6379"
//!   stream_url_ttl: 3600
//! upstream:
//!   timeout_secs: 30
//!   chunk_size: 8192
//! ```
//!
//! See [`RelayConfig`] for every option.

pub mod config;
pub mod error;
pub mod extractor;
pub mod metrics;
pub mod models;
pub mod redis_store;
pub mod relay;
pub mod resolver;
pub mod resources;
pub mod server;
pub mod tiered_cache;

pub use config::{CacheConfig, ExtractorConfig, RelayConfig, UpstreamConfig};
pub use error::{RelayError, Result};
pub use extractor::{ExtractorFactory, FormatExtractor, YtDlpExtractor};
pub use metrics::{RelayMetrics, ResolutionSource};
pub use models::{ByteRange, ExtractedInfo, MediaFormat, ResolvedMedia, StreamState};
pub use redis_store::RedisStore;
pub use relay::{RelayBody, RelayResponse, StreamOutcome, StreamRelay};
pub use resolver::{select_format, stream_url_key, MediaResolver};
pub use resources::{ResourceStore, WorkerId, WorkerResources};
pub use server::RelayServer;
pub use tiered_cache::{CacheEvent, CacheTierStatus, PrimaryStore, TieredCache, TieredCacheStats};
