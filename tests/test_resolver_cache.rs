//! Integration tests for MediaResolver caching and failure mapping

use async_trait::async_trait;
use media_relay::{
    stream_url_key, ExtractedInfo, ExtractorConfig, ExtractorFactory, FormatExtractor,
    MediaFormat, MediaResolver, RelayError, RelayMetrics, ResolutionSource, ResourceStore,
    TieredCache, UpstreamConfig,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Extractor answering from a canned description and recording every call
struct ScriptedExtractor {
    answer: std::result::Result<ExtractedInfo, RelayError>,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl ScriptedExtractor {
    fn new(answer: std::result::Result<ExtractedInfo, RelayError>) -> Arc<Self> {
        Arc::new(ScriptedExtractor {
            answer,
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FormatExtractor for ScriptedExtractor {
    async fn extract(&self, watch_url: &str) -> media_relay::Result<ExtractedInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(watch_url.to_string());
        self.answer.clone()
    }
}

struct Harness {
    resolver: MediaResolver,
    cache: Arc<TieredCache>,
    metrics: Arc<RelayMetrics>,
}

fn harness(extractor: Arc<ScriptedExtractor>) -> Harness {
    let cache = Arc::new(TieredCache::fallback_only(1000));
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let factory: ExtractorFactory =
        Arc::new(move || extractor.clone() as Arc<dyn FormatExtractor>);
    let resources = Arc::new(ResourceStore::new(&UpstreamConfig::default(), factory));
    let resolver = MediaResolver::new(
        Arc::clone(&cache),
        resources,
        Arc::clone(&metrics),
        &ExtractorConfig::default(),
        Duration::from_secs(3600),
    );
    Harness {
        resolver,
        cache,
        metrics,
    }
}

fn audio_info(url: &str) -> ExtractedInfo {
    ExtractedInfo {
        formats: vec![
            MediaFormat {
                acodec: Some("none".to_string()),
                url: Some("https://origin.example/video".to_string()),
                ..Default::default()
            },
            MediaFormat {
                acodec: Some("opus".to_string()),
                url: Some(url.to_string()),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_second_resolution_hits_cache() {
    let extractor = ScriptedExtractor::new(Ok(audio_info("https://origin.example/a")));
    let h = harness(extractor.clone());

    let first = h.resolver.resolve("abc").await.unwrap();
    assert_eq!(first.origin_url, "https://origin.example/a");
    assert!(!first.cached);

    let second = h.resolver.resolve("abc").await.unwrap();
    assert_eq!(second.origin_url, "https://origin.example/a");
    assert!(second.cached);

    assert_eq!(extractor.calls(), 1);
    assert_eq!(
        extractor.urls.lock().unwrap()[0],
        "https://www.youtube.com/watch?v=abc"
    );
    assert_eq!(h.metrics.resolutions(ResolutionSource::Extractor), 1);
    assert_eq!(h.metrics.resolutions(ResolutionSource::Cache), 1);
}

#[tokio::test]
async fn test_resolution_is_cached_under_stream_url_key() {
    let extractor = ScriptedExtractor::new(Ok(audio_info("https://origin.example/b")));
    let h = harness(extractor);

    h.resolver.resolve("xyz").await.unwrap();

    assert_eq!(
        h.cache.get(&stream_url_key("xyz")).await,
        Some(json!("https://origin.example/b"))
    );
}

#[tokio::test]
async fn test_precached_url_is_trusted() {
    let extractor = ScriptedExtractor::new(Err(RelayError::ExtractorError("unused".into())));
    let h = harness(extractor.clone());
    h.cache
        .set(
            "stream_url:warm",
            json!("https://origin.example/warm"),
            Duration::from_secs(60),
        )
        .await;

    let resolved = h.resolver.resolve("warm").await.unwrap();

    assert_eq!(resolved.origin_url, "https://origin.example/warm");
    assert_eq!(extractor.calls(), 0);
}

#[tokio::test]
async fn test_extractor_failure_is_not_found() {
    let extractor = ScriptedExtractor::new(Err(RelayError::ExtractorError(
        "Sign in to confirm your age".into(),
    )));
    let h = harness(extractor.clone());

    let err = h.resolver.resolve("blocked").await.unwrap_err();

    match &err {
        RelayError::ResolutionNotFound(cause) => assert!(cause.contains("Sign in")),
        other => panic!("expected ResolutionNotFound, got {:?}", other),
    }
    assert_eq!(err.to_http_status(), 404);
    assert_eq!(h.metrics.resolutions(ResolutionSource::NotFound), 1);
    assert_eq!(h.cache.get("stream_url:blocked").await, None);
}

#[tokio::test]
async fn test_no_playable_format_is_not_found() {
    let info = ExtractedInfo {
        formats: vec![MediaFormat {
            acodec: Some("none".to_string()),
            url: Some("https://origin.example/video".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    };
    let h = harness(ScriptedExtractor::new(Ok(info)));

    let result = h.resolver.resolve("video-only").await;
    assert!(matches!(result, Err(RelayError::ResolutionNotFound(_))));
}

#[tokio::test]
async fn test_requested_formats_without_audio_are_not_found() {
    let info = ExtractedInfo {
        requested_formats: vec![MediaFormat {
            acodec: Some("none".to_string()),
            url: Some("https://origin.example/video".to_string()),
            ..Default::default()
        }],
        formats: vec![MediaFormat {
            acodec: Some("opus".to_string()),
            url: Some("https://origin.example/audio".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    };
    let h = harness(ScriptedExtractor::new(Ok(info)));

    let result = h.resolver.resolve("merged").await;

    assert!(matches!(result, Err(RelayError::ResolutionNotFound(_))));
    assert_eq!(h.cache.get("stream_url:merged").await, None);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let extractor = ScriptedExtractor::new(Ok(ExtractedInfo::default()));
    let h = harness(extractor.clone());

    assert!(h.resolver.resolve("missing").await.is_err());
    assert!(h.resolver.resolve("missing").await.is_err());

    assert_eq!(extractor.calls(), 2);
}

#[tokio::test]
async fn test_empty_media_id_rejected_before_cache() {
    let extractor = ScriptedExtractor::new(Ok(audio_info("https://origin.example/a")));
    let h = harness(extractor.clone());

    for id in ["", "   "] {
        let result = h.resolver.resolve(id).await;
        assert!(matches!(result, Err(RelayError::InvalidMediaId(_))));
    }
    assert_eq!(extractor.calls(), 0);
    assert_eq!(h.cache.stats().misses, 0);
}

#[tokio::test]
async fn test_invalidate_forces_fresh_resolution() {
    let extractor = ScriptedExtractor::new(Ok(audio_info("https://origin.example/a")));
    let h = harness(extractor.clone());

    h.resolver.resolve("abc").await.unwrap();
    assert!(h.resolver.invalidate("abc").await);
    let again = h.resolver.resolve("abc").await.unwrap();

    assert!(!again.cached);
    assert_eq!(extractor.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_resolutions_are_not_collapsed() {
    let extractor = ScriptedExtractor::new(Ok(audio_info("https://origin.example/a")));
    let h = Arc::new(harness(extractor.clone()));

    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = Arc::clone(&h);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            h.resolver.resolve("cold").await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().origin_url, "https://origin.example/a");
    }

    // Every call either ran the extractor or hit the cache; none failed
    let calls = extractor.calls();
    assert!((1..=8).contains(&calls));
    assert_eq!(
        h.metrics.resolutions(ResolutionSource::Extractor)
            + h.metrics.resolutions(ResolutionSource::Cache),
        8
    );
}
