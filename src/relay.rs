//! Streaming relay from origin hosts to clients
//!
//! A relay call moves through `Resolving → Connecting → Streaming` and ends in
//! exactly one of `Complete`, `Failed` or `Aborted`:
//!
//! ```text
//!   stream(id, range)
//!        │ resolve (cache first)          ResolutionNotFound ──► Err
//!        ▼
//!   GET origin, Range forwarded verbatim  connect error/timeout ──► Err
//!        │                                403/410 also evicts the cached URL
//!        ▼
//!   translate_headers (206 or forced 200)
//!        ▼
//!   RelayBody::next_chunk / forward       end of body ──► Complete
//!                                         read error  ──► Failed
//!                                         client gone ──► Aborted
//! ```
//!
//! The upstream response is owned by [`RelayBody`], so it is released as soon as
//! the body reaches a terminal state or is dropped.

use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::models::{ByteRange, StreamState};
use crate::resolver::MediaResolver;
use crate::resources::ResourceStore;
use bytes::Bytes;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How a relayed stream ended
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    /// The whole upstream body was forwarded
    Complete { bytes: u64 },
    /// Reading from the origin failed mid-stream
    Failed { bytes: u64, error: RelayError },
    /// The client went away before the end of the body
    Aborted { bytes: u64 },
}

impl StreamOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StreamOutcome::Complete { .. } => "complete",
            StreamOutcome::Failed { .. } => "failed",
            StreamOutcome::Aborted { .. } => "aborted",
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            StreamOutcome::Complete { bytes }
            | StreamOutcome::Failed { bytes, .. }
            | StreamOutcome::Aborted { bytes } => *bytes,
        }
    }
}

/// Status and headers for the client, plus the body still to be read
pub struct RelayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RelayBody,
}

/// Translate an origin response into the status and headers sent to the client
///
/// - `Accept-Ranges: bytes` is always set
/// - `Content-Type` is mirrored, or `default_content_type` when absent
/// - a ranged request answered with 206 keeps 206, `Content-Range` and `Content-Length`
/// - anything else becomes 200 and never carries a `Content-Range`
pub fn translate_headers(
    client_range: Option<&str>,
    upstream_status: StatusCode,
    upstream_headers: &HeaderMap,
    default_content_type: &str,
) -> (StatusCode, HeaderMap) {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let content_type = upstream_headers
        .get(CONTENT_TYPE)
        .cloned()
        .or_else(|| HeaderValue::from_str(default_content_type).ok());
    if let Some(content_type) = content_type {
        headers.insert(CONTENT_TYPE, content_type);
    }

    if let Some(length) = upstream_headers.get(CONTENT_LENGTH) {
        headers.insert(CONTENT_LENGTH, length.clone());
    }

    if client_range.is_some() && upstream_status == StatusCode::PARTIAL_CONTENT {
        if let Some(range) = upstream_headers.get(CONTENT_RANGE) {
            headers.insert(CONTENT_RANGE, range.clone());
        }
        (StatusCode::PARTIAL_CONTENT, headers)
    } else {
        (StatusCode::OK, headers)
    }
}

/// Lazy, forward-only producer of upstream chunks
///
/// Yields chunks of at most `chunk_size` bytes. Once a terminal state is reached
/// the upstream response is dropped and no further reads happen.
pub struct RelayBody {
    media_id: String,
    upstream: Option<reqwest::Response>,
    pending: Bytes,
    chunk_size: usize,
    state: StreamState,
    bytes_forwarded: u64,
    metrics: Arc<RelayMetrics>,
}

impl RelayBody {
    fn new(
        media_id: &str,
        upstream: reqwest::Response,
        chunk_size: usize,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        RelayBody {
            media_id: media_id.to_string(),
            upstream: Some(upstream),
            pending: Bytes::new(),
            chunk_size: chunk_size.max(1),
            state: StreamState::Streaming,
            bytes_forwarded: 0,
            metrics,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Bytes handed out so far
    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded
    }

    /// Whether the upstream response is still held
    pub fn holds_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    /// Next chunk of the body, `None` once the body is exhausted
    ///
    /// A read error fails the stream; the error is returned once and later calls
    /// yield `None`.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if !self.pending.is_empty() {
                let take = self.pending.len().min(self.chunk_size);
                let chunk = self.pending.split_to(take);
                self.bytes_forwarded += chunk.len() as u64;
                return Ok(Some(chunk));
            }

            let Some(upstream) = self.upstream.as_mut() else {
                return Ok(None);
            };

            let next = upstream.chunk().await;
            match next {
                Ok(Some(data)) => self.pending = data,
                Ok(None) => {
                    self.finish(StreamState::Complete);
                    debug!(
                        "Stream complete for media_id={}: {} bytes",
                        self.media_id, self.bytes_forwarded
                    );
                    return Ok(None);
                }
                Err(e) => {
                    self.finish(StreamState::Failed);
                    warn!(
                        "Upstream read failed for media_id={} after {} bytes: {}",
                        self.media_id, self.bytes_forwarded, e
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// Pump the body into `sender` until it ends or the receiver goes away
    ///
    /// The receiver is watched while waiting on the origin, so a client that
    /// leaves during a stalled read releases the upstream at once. No chunk is
    /// requested after the disconnect is seen. A read error is also sent down
    /// the channel so the consumer can cut the connection instead of ending the
    /// body cleanly.
    pub async fn forward(mut self, sender: mpsc::Sender<Result<Bytes>>) -> StreamOutcome {
        loop {
            let next = tokio::select! {
                biased;
                _ = sender.closed() => None,
                next = self.next_chunk() => Some(next),
            };

            match next {
                None => return self.abort(0),
                Some(Ok(Some(chunk))) => {
                    let len = chunk.len() as u64;
                    if sender.send(Ok(chunk)).await.is_err() {
                        return self.abort(len);
                    }
                }
                Some(Ok(None)) => {
                    return StreamOutcome::Complete {
                        bytes: self.bytes_forwarded,
                    }
                }
                Some(Err(error)) => {
                    let _ = sender.send(Err(error.clone())).await;
                    return StreamOutcome::Failed {
                        bytes: self.bytes_forwarded,
                        error,
                    };
                }
            }
        }
    }

    /// The client is gone; `unsent` bytes were handed out but never delivered
    fn abort(&mut self, unsent: u64) -> StreamOutcome {
        self.bytes_forwarded -= unsent;
        self.finish(StreamState::Aborted);
        debug!(
            "Client went away for media_id={} after {} bytes",
            self.media_id, self.bytes_forwarded
        );
        StreamOutcome::Aborted {
            bytes: self.bytes_forwarded,
        }
    }

    fn finish(&mut self, state: StreamState) {
        if self.state.is_terminal() {
            return;
        }
        self.upstream = None;
        self.pending = Bytes::new();
        self.state = state;
        self.metrics.record_stream(state.label(), self.bytes_forwarded);
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            debug!(
                "Relay body dropped mid-stream for media_id={} after {} bytes",
                self.media_id, self.bytes_forwarded
            );
            self.finish(StreamState::Aborted);
        }
    }
}

/// Origin statuses meaning the signed origin URL has expired
fn is_stale_origin_status(status: StatusCode) -> bool {
    status == StatusCode::FORBIDDEN || status == StatusCode::GONE
}

fn trace_state(media_id: &str, state: StreamState) {
    debug!("Relay media_id={} state={}", media_id, state.label());
}

/// Relays origin bytes for media ids
pub struct StreamRelay {
    resolver: Arc<MediaResolver>,
    resources: Arc<ResourceStore>,
    metrics: Arc<RelayMetrics>,
    timeout: Duration,
    chunk_size: usize,
    default_content_type: String,
}

impl StreamRelay {
    pub fn new(
        resolver: Arc<MediaResolver>,
        resources: Arc<ResourceStore>,
        metrics: Arc<RelayMetrics>,
        upstream: &UpstreamConfig,
    ) -> Self {
        StreamRelay {
            resolver,
            resources,
            metrics,
            timeout: upstream.timeout(),
            chunk_size: upstream.chunk_size,
            default_content_type: upstream.default_content_type.clone(),
        }
    }

    pub fn resolver(&self) -> &MediaResolver {
        &self.resolver
    }

    /// Start relaying `media_id`, forwarding the client's `Range` header verbatim
    ///
    /// Returns once the origin has answered; the body is read lazily through
    /// [`RelayBody`]. Every origin status is relayed through
    /// [`translate_headers`]. A 403 or 410 also drops the cached origin URL so
    /// the next request resolves again.
    pub async fn stream(&self, media_id: &str, range: Option<&str>) -> Result<RelayResponse> {
        trace_state(media_id, StreamState::Resolving);
        let resolved = match self.resolver.resolve(media_id).await {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!("Relay for media_id={} failed while resolving: {}", media_id, e);
                return Err(e);
            }
        };

        if let Some(range) = range {
            match ByteRange::from_header(range) {
                Ok(parsed) => debug!("Client range for media_id={}: {:?}", media_id, parsed),
                Err(e) => debug!("Forwarding unparsed range {:?}: {}", range, e),
            }
        }

        trace_state(media_id, StreamState::Connecting);
        let upstream = match self.connect(&resolved.origin_url, range).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.metrics.record_stream("failed", 0);
                return Err(e);
            }
        };

        let upstream_status = upstream.status();
        if is_stale_origin_status(upstream_status) {
            warn!(
                "Origin rejected cached URL for media_id={}: status={}",
                media_id, upstream_status
            );
            self.resolver.invalidate(media_id).await;
        }

        let (status, headers) = translate_headers(
            range,
            upstream_status,
            upstream.headers(),
            &self.default_content_type,
        );
        info!(
            "Relaying media_id={}: origin status={}, client status={}, cached={}",
            media_id, upstream_status, status, resolved.cached
        );

        trace_state(media_id, StreamState::Streaming);
        Ok(RelayResponse {
            status,
            headers,
            body: RelayBody::new(media_id, upstream, self.chunk_size, Arc::clone(&self.metrics)),
        })
    }

    async fn connect(&self, url: &str, range: Option<&str>) -> Result<reqwest::Response> {
        let resources = self.resources.for_current_worker()?;
        let mut request = resources.http.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!("Upstream request failed for url={}: {}", url, e);
                Err(e.into())
            }
            Err(_) => {
                warn!("Upstream request timed out for url={} after {:?}", url, self.timeout);
                Err(RelayError::Timeout(format!(
                    "origin did not answer within {:?}",
                    self.timeout
                )))
            }
        }
    }
}
