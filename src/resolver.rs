//! Media id resolution
//!
//! A media id is turned into a direct origin URL by asking the extractor for
//! candidate formats and picking the first playable one. Answers are cached
//! under [`stream_url_key`] and trusted without revalidation until they expire;
//! an origin URL that went stale surfaces when the relay connects.

use crate::config::ExtractorConfig;
use crate::error::{RelayError, Result};
use crate::metrics::{RelayMetrics, ResolutionSource};
use crate::models::{ExtractedInfo, ResolvedMedia};
use crate::resources::ResourceStore;
use crate::tiered_cache::TieredCache;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cache key holding the origin URL of a media id
pub fn stream_url_key(media_id: &str) -> String {
    format!("stream_url:{}", media_id)
}

/// Pick the origin URL from an extractor description
///
/// Priority: the top-level `url`; otherwise, when `requested_formats` is
/// non-empty, the first of them carrying audio (a missing URL on that entry
/// means nothing is playable); otherwise the first listed format carrying
/// audio and a URL. `formats` is never consulted when `requested_formats` is
/// non-empty.
pub fn select_format(info: &ExtractedInfo) -> Option<&str> {
    if let Some(url) = info.url.as_deref().filter(|u| !u.is_empty()) {
        return Some(url);
    }

    if !info.requested_formats.is_empty() {
        return info
            .requested_formats
            .iter()
            .find(|format| format.has_audio())
            .and_then(|format| format.usable_url());
    }

    info.formats
        .iter()
        .filter(|format| format.has_audio())
        .find_map(|format| format.usable_url())
}

/// Resolves media ids to origin URLs, cache first
pub struct MediaResolver {
    cache: Arc<TieredCache>,
    resources: Arc<ResourceStore>,
    metrics: Arc<RelayMetrics>,
    extractor: ExtractorConfig,
    ttl: Duration,
}

impl MediaResolver {
    /// Create a resolver
    ///
    /// # Arguments
    /// * `ttl` - Lifetime of cached origin URLs
    pub fn new(
        cache: Arc<TieredCache>,
        resources: Arc<ResourceStore>,
        metrics: Arc<RelayMetrics>,
        extractor: &ExtractorConfig,
        ttl: Duration,
    ) -> Self {
        MediaResolver {
            cache,
            resources,
            metrics,
            extractor: extractor.clone(),
            ttl,
        }
    }

    /// Resolve a media id to a playable origin URL
    ///
    /// Concurrent cold resolutions of the same id each run the extractor.
    pub async fn resolve(&self, media_id: &str) -> Result<ResolvedMedia> {
        if media_id.trim().is_empty() {
            return Err(RelayError::InvalidMediaId(media_id.to_string()));
        }

        let start = Instant::now();
        let key = stream_url_key(media_id);

        if let Some(Value::String(url)) = self.cache.get(&key).await {
            debug!("Resolved from cache: media_id={}", media_id);
            self.metrics
                .record_resolution(ResolutionSource::Cache, start.elapsed());
            return Ok(ResolvedMedia::new(media_id, url, true));
        }

        match self.extract(media_id).await {
            Ok(url) => {
                if !self
                    .cache
                    .set(&key, Value::String(url.clone()), self.ttl)
                    .await
                {
                    warn!("Failed to cache origin URL for media_id={}", media_id);
                }
                info!(
                    "Resolved media_id={} in {:?}",
                    media_id,
                    start.elapsed()
                );
                self.metrics
                    .record_resolution(ResolutionSource::Extractor, start.elapsed());
                Ok(ResolvedMedia::new(media_id, url, false))
            }
            Err(e) => {
                warn!("Resolution failed for media_id={}: {}", media_id, e);
                self.metrics
                    .record_resolution(ResolutionSource::NotFound, start.elapsed());
                Err(e)
            }
        }
    }

    /// Drop the cached origin URL of a media id
    pub async fn invalidate(&self, media_id: &str) -> bool {
        debug!("Invalidating cached origin URL for media_id={}", media_id);
        self.cache.delete(&stream_url_key(media_id)).await
    }

    async fn extract(&self, media_id: &str) -> Result<String> {
        let resources = self.resources.for_current_worker()?;
        let watch_url = self.extractor.watch_url(media_id);

        let info = match resources.extractor.extract(&watch_url).await {
            Ok(info) => {
                self.metrics.record_extractor_invocation(true);
                info
            }
            Err(e) => {
                self.metrics.record_extractor_invocation(false);
                return Err(RelayError::ResolutionNotFound(format!(
                    "{}: {}",
                    media_id, e
                )));
            }
        };

        select_format(&info).map(str::to_string).ok_or_else(|| {
            RelayError::ResolutionNotFound(format!("{}: no playable audio format", media_id))
        })
    }
}
