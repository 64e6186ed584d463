//! Two-tier key-value cache with a networked primary store and in-process fallback
//!
//! This module provides the cache every other component goes through:
//! - Primary: a networked store (Redis in production, see [`RedisStore`](crate::redis_store::RedisStore))
//! - Fallback: an in-process map with per-entry expiry
//!
//! Behavior:
//! - The primary is probed once, on first use. A failed probe downgrades the cache
//!   to fallback-only for the rest of its lifetime (`UNCHECKED -> AVAILABLE | DEGRADED`)
//! - Primary operation errors and timeouts fall through to the fallback and are
//!   reported as [`CacheEvent`]s, never to the caller
//! - Expired fallback entries are purged lazily on read, and swept in bulk once the
//!   map grows past the cleanup threshold. Unexpired entries are never evicted
//! - Callers cannot tell which tier served a value

use crate::config::CacheConfig;
use crate::redis_store::RedisStore;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, OnceCell};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Expiry horizon for fallback entries whose TTL overflows the clock
const MAX_FALLBACK_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Error raised by a primary store; absorbed inside [`TieredCache`]
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// A networked key-value store used as the preferred cache tier
///
/// Values are JSON text; expiry is delegated to the store.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Short human-readable name used in logs
    fn name(&self) -> &str;

    /// Establish (or verify) the connection
    async fn ping(&self) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Structured cache event, published for observers and never surfaced to callers
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// The primary answered its first probe
    PrimaryAvailable { store: String },
    /// The primary is permanently unavailable for this cache instance
    Degraded { reason: String },
    /// A single primary operation failed and the fallback took over
    PrimaryOpFailed {
        op: &'static str,
        key: String,
        error: String,
    },
    /// The fallback map went over its threshold and expired entries were swept
    FallbackCleanup { removed: usize, remaining: usize },
}

/// Observable state of the primary tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheTierStatus {
    Unchecked,
    Available { store: String },
    Degraded { reason: String },
}

impl CacheTierStatus {
    /// Short description used by the health endpoint
    pub fn describe(&self) -> String {
        match self {
            CacheTierStatus::Unchecked => "not yet connected".to_string(),
            CacheTierStatus::Available { store } => format!("connected ({})", store),
            CacheTierStatus::Degraded { reason } => {
                format!("degraded, using memory cache ({})", reason)
            }
        }
    }
}

/// Outcome of the one-time primary probe
#[derive(Debug, Clone)]
enum PrimaryState {
    Available,
    Degraded(String),
}

/// Fallback entry with absolute expiry
#[derive(Debug, Clone)]
struct FallbackEntry {
    value: Value,
    expires_at: Instant,
}

impl FallbackEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TieredCacheStats {
    pub primary_hits: u64,
    pub primary_errors: u64,
    pub fallback_hits: u64,
    pub misses: u64,
    pub fallback_entries: usize,
    pub cleanups: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    primary_hits: AtomicU64,
    primary_errors: AtomicU64,
    fallback_hits: AtomicU64,
    misses: AtomicU64,
    cleanups: AtomicU64,
}

/// Two-tier cache with a networked primary and an in-process fallback
pub struct TieredCache {
    primary: Option<Arc<dyn PrimaryStore>>,
    primary_state: OnceCell<PrimaryState>,
    /// Reason used when no primary was configured at all
    unconfigured_reason: String,
    primary_timeout: Duration,

    fallback: Mutex<HashMap<String, FallbackEntry>>,
    cleanup_threshold: usize,

    stats: StatCounters,
    events: broadcast::Sender<CacheEvent>,
}

impl TieredCache {
    /// Create a new two-tier cache
    ///
    /// # Arguments
    /// * `primary` - Networked store, or `None` for fallback-only operation
    /// * `primary_timeout` - Upper bound on every primary call
    /// * `cleanup_threshold` - Fallback size above which expired entries are swept
    pub fn new(
        primary: Option<Arc<dyn PrimaryStore>>,
        primary_timeout: Duration,
        cleanup_threshold: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        TieredCache {
            primary,
            primary_state: OnceCell::new(),
            unconfigured_reason: "primary store not configured".to_string(),
            primary_timeout,
            fallback: Mutex::new(HashMap::new()),
            cleanup_threshold,
            stats: StatCounters::default(),
            events,
        }
    }

    /// Create a cache with no primary store
    pub fn fallback_only(cleanup_threshold: usize) -> Self {
        Self::new(None, Duration::from_millis(500), cleanup_threshold)
    }

    /// Build the cache described by the configuration
    ///
    /// An unusable Redis URL is not fatal: the cache starts fallback-only and the
    /// reason is reported on first use.
    pub fn from_config(config: &CacheConfig) -> Self {
        let primary: Option<Arc<dyn PrimaryStore>> = match config.redis_url.as_deref() {
            Some(url) => match RedisStore::open(url) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!("Invalid primary store URL, using memory cache: {}", e);
                    let mut cache = Self::new(
                        None,
                        config.primary_timeout(),
                        config.fallback_cleanup_threshold,
                    );
                    cache.unconfigured_reason = format!("invalid primary store URL: {}", e);
                    return cache;
                }
            },
            None => None,
        };

        info!(
            "Initializing tiered cache: primary={}, cleanup_threshold={}",
            primary.as_ref().map(|p| p.name()).unwrap_or("none"),
            config.fallback_cleanup_threshold
        );

        Self::new(
            primary,
            config.primary_timeout(),
            config.fallback_cleanup_threshold,
        )
    }

    /// Subscribe to internal cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Get a value, checking the primary (when available) then the fallback
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(primary) = self.available_primary().await {
            match self.bounded(primary.get(key)).await {
                Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => {
                        self.stats.primary_hits.fetch_add(1, Ordering::Relaxed);
                        debug!("Cache hit: key={}", key);
                        return Some(value);
                    }
                    Err(e) => self.primary_failed(
                        "get",
                        key,
                        CacheError::Serialization(e.to_string()),
                    ),
                },
                Ok(None) => {}
                Err(e) => self.primary_failed("get", key, e),
            }
        }

        let now = Instant::now();
        let mut fallback = self.lock_fallback();
        let expired = match fallback.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.stats.fallback_hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit: key={}", key);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            fallback.remove(key);
            debug!("Cache entry expired: key={}", key);
        } else {
            debug!("Cache miss: key={}", key);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value with a TTL
    ///
    /// Always succeeds from the caller's point of view: if the primary rejects the
    /// write, the value lands in the fallback instead.
    pub async fn set(&self, key: &str, value: Value, ttl: Duration) -> bool {
        if let Some(primary) = self.available_primary().await {
            let payload = value.to_string();
            match self.bounded(primary.set(key, &payload, ttl)).await {
                Ok(()) => {
                    debug!("Stored in primary: key={}, ttl={:?}", key, ttl);
                    return true;
                }
                Err(e) => self.primary_failed("set", key, e),
            }
        }

        let now = Instant::now();
        let mut fallback = self.lock_fallback();
        fallback.insert(
            key.to_string(),
            FallbackEntry {
                value,
                expires_at: now
                    .checked_add(ttl)
                    .unwrap_or_else(|| now + MAX_FALLBACK_TTL),
            },
        );
        debug!("Stored in fallback: key={}, ttl={:?}", key, ttl);

        if fallback.len() > self.cleanup_threshold {
            self.sweep_expired(&mut fallback, now);
        }

        true
    }

    /// Delete a key from both tiers
    pub async fn delete(&self, key: &str) -> bool {
        if let Some(primary) = self.available_primary().await {
            if let Err(e) = self.bounded(primary.delete(key)).await {
                self.primary_failed("delete", key, e);
            }
        }

        self.lock_fallback().remove(key);
        debug!("Deleted: key={}", key);
        true
    }

    /// Typed lookup; a value that does not deserialize into `T` is treated as absent
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!("Ignoring cached value with unexpected shape: key={}, error={}", key, e);
                None
            }
        }
    }

    /// Typed store
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, value, ttl).await,
            Err(e) => {
                error!("Failed to serialize cache value: key={}, error={}", key, e);
                false
            }
        }
    }

    /// Current state of the primary tier
    pub fn tier_status(&self) -> CacheTierStatus {
        match self.primary_state.get() {
            None => CacheTierStatus::Unchecked,
            Some(PrimaryState::Available) => CacheTierStatus::Available {
                store: self
                    .primary
                    .as_ref()
                    .map(|p| p.name().to_string())
                    .unwrap_or_default(),
            },
            Some(PrimaryState::Degraded(reason)) => CacheTierStatus::Degraded {
                reason: reason.clone(),
            },
        }
    }

    /// Probe the primary now instead of waiting for the first operation
    pub async fn warm_up(&self) -> CacheTierStatus {
        self.available_primary().await;
        self.tier_status()
    }

    /// Number of entries currently held by the fallback, expired ones included
    pub fn fallback_len(&self) -> usize {
        self.lock_fallback().len()
    }

    /// Get cache statistics
    pub fn stats(&self) -> TieredCacheStats {
        TieredCacheStats {
            primary_hits: self.stats.primary_hits.load(Ordering::Relaxed),
            primary_errors: self.stats.primary_errors.load(Ordering::Relaxed),
            fallback_hits: self.stats.fallback_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            fallback_entries: self.fallback_len(),
            cleanups: self.stats.cleanups.load(Ordering::Relaxed),
        }
    }

    /// Resolve the one-time primary probe, returning the primary if usable
    async fn available_primary(&self) -> Option<&Arc<dyn PrimaryStore>> {
        let state = self
            .primary_state
            .get_or_init(|| async {
                let Some(primary) = self.primary.as_ref() else {
                    return self.mark_degraded(self.unconfigured_reason.clone());
                };

                match self.bounded(primary.ping()).await {
                    Ok(()) => {
                        info!("Connected to primary cache store: {}", primary.name());
                        self.publish(CacheEvent::PrimaryAvailable {
                            store: primary.name().to_string(),
                        });
                        PrimaryState::Available
                    }
                    Err(e) => self.mark_degraded(format!("{} unavailable: {}", primary.name(), e)),
                }
            })
            .await;

        match state {
            PrimaryState::Available => self.primary.as_ref(),
            PrimaryState::Degraded(_) => None,
        }
    }

    fn mark_degraded(&self, reason: String) -> PrimaryState {
        warn!("Primary cache store unavailable, using memory cache: {}", reason);
        self.publish(CacheEvent::Degraded {
            reason: reason.clone(),
        });
        PrimaryState::Degraded(reason)
    }

    fn primary_failed(&self, op: &'static str, key: &str, e: CacheError) {
        self.stats.primary_errors.fetch_add(1, Ordering::Relaxed);
        error!("Primary cache {} error: key={}, error={}", op, key, e);
        self.publish(CacheEvent::PrimaryOpFailed {
            op,
            key: key.to_string(),
            error: e.to_string(),
        });
    }

    /// Apply the primary timeout; an elapsed call counts as a primary failure
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.primary_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.primary_timeout)),
        }
    }

    fn sweep_expired(&self, fallback: &mut HashMap<String, FallbackEntry>, now: Instant) {
        let before = fallback.len();
        fallback.retain(|_, entry| !entry.is_expired(now));
        let removed = before - fallback.len();
        self.stats.cleanups.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Fallback cleanup: removed={}, remaining={}",
            removed,
            fallback.len()
        );
        self.publish(CacheEvent::FallbackCleanup {
            removed,
            remaining: fallback.len(),
        });
    }

    fn lock_fallback(&self) -> MutexGuard<'_, HashMap<String, FallbackEntry>> {
        self.fallback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: CacheEvent) {
        // No subscribers is the common case
        let _ = self.events.send(event);
    }
}
