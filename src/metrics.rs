//! Prometheus metrics for resolution and streaming
//!
//! Metrics live in their own [`Registry`] so several relays (and tests) can
//! coexist in one process without colliding in the default registry.

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Where a resolution was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Cache,
    Extractor,
    NotFound,
}

impl ResolutionSource {
    fn label(&self) -> &'static str {
        match self {
            ResolutionSource::Cache => "cache",
            ResolutionSource::Extractor => "extractor",
            ResolutionSource::NotFound => "not_found",
        }
    }
}

/// Metrics for the relay pipeline
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,

    /// Resolutions by source (cache/extractor/not_found)
    pub resolutions_total: Arc<CounterVec>,

    /// Extractor invocations by result (success/failure)
    pub extractor_invocations_total: Arc<CounterVec>,

    /// Finished streams by outcome (complete/failed/aborted)
    pub streams_total: Arc<CounterVec>,

    /// Bytes handed to clients
    pub bytes_forwarded_total: Arc<IntCounter>,

    /// Duration of resolutions in seconds
    pub resolution_duration_seconds: Arc<HistogramVec>,
}

impl RelayMetrics {
    /// Create metrics in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let resolutions_total = CounterVec::new(
            Opts::new(
                "media_relay_resolutions_total",
                "Total number of media id resolutions",
            ),
            &["source"],
        )?;
        registry.register(Box::new(resolutions_total.clone()))?;

        let extractor_invocations_total = CounterVec::new(
            Opts::new(
                "media_relay_extractor_invocations_total",
                "Total number of extractor invocations",
            ),
            &["result"],
        )?;
        registry.register(Box::new(extractor_invocations_total.clone()))?;

        let streams_total = CounterVec::new(
            Opts::new("media_relay_streams_total", "Total number of finished streams"),
            &["outcome"],
        )?;
        registry.register(Box::new(streams_total.clone()))?;

        let bytes_forwarded_total = IntCounter::new(
            "media_relay_bytes_forwarded_total",
            "Total number of bytes forwarded to clients",
        )?;
        registry.register(Box::new(bytes_forwarded_total.clone()))?;

        let resolution_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "media_relay_resolution_duration_seconds",
                "Duration of media id resolutions in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["source"],
        )?;
        registry.register(Box::new(resolution_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            resolutions_total: Arc::new(resolutions_total),
            extractor_invocations_total: Arc::new(extractor_invocations_total),
            streams_total: Arc::new(streams_total),
            bytes_forwarded_total: Arc::new(bytes_forwarded_total),
            resolution_duration_seconds: Arc::new(resolution_duration_seconds),
        })
    }

    /// Record a finished resolution
    pub fn record_resolution(&self, source: ResolutionSource, duration: Duration) {
        self.resolutions_total
            .with_label_values(&[source.label()])
            .inc();
        self.resolution_duration_seconds
            .with_label_values(&[source.label()])
            .observe(duration.as_secs_f64());
    }

    /// Record one extractor call
    pub fn record_extractor_invocation(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.extractor_invocations_total
            .with_label_values(&[result])
            .inc();
    }

    /// Record a stream reaching a terminal state
    pub fn record_stream(&self, outcome: &str, bytes: u64) {
        self.streams_total.with_label_values(&[outcome]).inc();
        self.bytes_forwarded_total.inc_by(bytes);
    }

    /// Current value of a labelled resolution counter
    pub fn resolutions(&self, source: ResolutionSource) -> u64 {
        self.resolutions_total
            .with_label_values(&[source.label()])
            .get() as u64
    }

    /// Current value of a labelled stream counter
    pub fn streams(&self, outcome: &str) -> u64 {
        self.streams_total.with_label_values(&[outcome]).get() as u64
    }

    /// Render every metric in Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
