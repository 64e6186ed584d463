//! HTTP front end
//!
//! Routes:
//! - `GET /stream/{media_id}` relays the media, honouring `Range`
//! - `GET /resolve/{media_id}` returns the resolved origin as JSON
//! - `GET /health` reports service and cache tier status
//! - `GET /metrics` exposes Prometheus metrics
//!
//! Failures are answered with `{"error": {"code": ..., "message": ...}}`.

use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::relay::StreamRelay;
use crate::tiered_cache::TieredCache;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, RANGE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Response body type used by every route
pub type RelayHttpBody = BoxBody<Bytes, RelayError>;

/// Chunks in flight between the relay task and the connection
const STREAM_CHANNEL_CAPACITY: usize = 4;

/// Body fed by a [`RelayBody::forward`](crate::relay::RelayBody::forward) task
///
/// Dropping it (the connection closed) closes the channel, which aborts the
/// forwarding task at its next send.
pub struct ChannelBody {
    receiver: mpsc::Receiver<Result<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, RelayError>>> {
        self.receiver
            .poll_recv(cx)
            .map(|item| item.map(|chunk| chunk.map(Frame::data)))
    }
}

/// Shared state behind every connection
struct ServerState {
    relay: Arc<StreamRelay>,
    cache: Arc<TieredCache>,
    metrics: Arc<RelayMetrics>,
}

/// HTTP/1 server exposing the relay
pub struct RelayServer {
    state: Arc<ServerState>,
}

impl RelayServer {
    pub fn new(
        relay: Arc<StreamRelay>,
        cache: Arc<TieredCache>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        RelayServer {
            state: Arc::new(ServerState {
                relay,
                cache,
                metrics,
            }),
        }
    }

    /// Bind `addr` and serve until the process ends
    pub async fn start(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted from `listener`
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Media relay listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle_request(req, state).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving connection from {}: {:?}", peer, err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> std::result::Result<Response<RelayHttpBody>, Infallible> {
    if req.method() != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "405 Method Not Allowed",
        ));
    }

    let path = req.uri().path().to_string();
    let response = if let Some(media_id) = path.strip_prefix("/stream/") {
        let range = req
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        stream_response(&state, media_id, range.as_deref()).await
    } else if let Some(media_id) = path.strip_prefix("/resolve/") {
        resolve_response(&state, media_id).await
    } else {
        match path.as_str() {
            "/health" => Ok(health_response(&state)),
            "/metrics" => metrics_response(&state),
            _ => Ok(text_response(StatusCode::NOT_FOUND, "404 Not Found")),
        }
    };

    Ok(response.unwrap_or_else(|e| error_response(&e)))
}

async fn stream_response(
    state: &ServerState,
    media_id: &str,
    range: Option<&str>,
) -> Result<Response<RelayHttpBody>> {
    let relayed = state.relay.stream(media_id, range).await?;

    let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let media_id = media_id.to_string();
    tokio::spawn(async move {
        let outcome = relayed.body.forward(sender).await;
        debug!(
            "Stream for media_id={} ended: {} ({} bytes)",
            media_id,
            outcome.label(),
            outcome.bytes()
        );
    });

    let mut response = Response::new(BoxBody::new(ChannelBody { receiver }));
    *response.status_mut() = relayed.status;
    *response.headers_mut() = relayed.headers;
    Ok(response)
}

async fn resolve_response(state: &ServerState, media_id: &str) -> Result<Response<RelayHttpBody>> {
    let resolved = state.relay.resolver().resolve(media_id).await?;
    json_response(StatusCode::OK, &resolved)
}

fn health_response(state: &ServerState) -> Response<RelayHttpBody> {
    let body = json!({
        "status": "healthy",
        "service": "media-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "cache": state.cache.tier_status().describe(),
        },
    });
    full_response(
        StatusCode::OK,
        "application/json",
        Bytes::from(body.to_string()),
    )
}

fn metrics_response(state: &ServerState) -> Result<Response<RelayHttpBody>> {
    let text = state
        .metrics
        .encode()
        .map_err(|e| RelayError::InternalError(format!("Failed to encode metrics: {}", e)))?;
    Ok(full_response(
        StatusCode::OK,
        "text/plain; version=0.0.4; charset=utf-8",
        Bytes::from(text),
    ))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<RelayHttpBody>> {
    let body = serde_json::to_vec(value)?;
    Ok(full_response(status, "application/json", Bytes::from(body)))
}

/// JSON error body with the status the error maps to
pub fn error_response(err: &RelayError) -> Response<RelayHttpBody> {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }

    let body = json!({
        "error": {
            "code": err.error_code(),
            "message": err.to_string(),
        }
    });
    full_response(status, "application/json", Bytes::from(body.to_string()))
}

fn text_response(status: StatusCode, text: &'static str) -> Response<RelayHttpBody> {
    full_response(status, "text/plain", Bytes::from_static(text.as_bytes()))
}

fn full_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<RelayHttpBody> {
    let body = Full::new(body).map_err(|never| match never {}).boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_text(response: Response<RelayHttpBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(&RelayError::ResolutionNotFound("abc".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert!(body["error"]["message"].as_str().unwrap().contains("abc"));
    }

    #[tokio::test]
    async fn test_error_response_statuses() {
        let cases = [
            (RelayError::InvalidMediaId(String::new()), StatusCode::BAD_REQUEST),
            (RelayError::UpstreamConnect("refused".into()), StatusCode::BAD_GATEWAY),
            (RelayError::Timeout("slow".into()), StatusCode::GATEWAY_TIMEOUT),
            (RelayError::InternalError("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(error_response(&err).status(), status, "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_channel_body_yields_chunks_then_ends() {
        let (sender, receiver) = mpsc::channel(4);
        sender.send(Ok(Bytes::from_static(b"ab"))).await.unwrap();
        sender.send(Ok(Bytes::from_static(b"cd"))).await.unwrap();
        drop(sender);

        let collected = ChannelBody { receiver }.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"abcd");
    }

    #[tokio::test]
    async fn test_channel_body_surfaces_errors() {
        let (sender, receiver) = mpsc::channel(4);
        sender.send(Ok(Bytes::from_static(b"ab"))).await.unwrap();
        sender
            .send(Err(RelayError::UpstreamConnect("reset".into())))
            .await
            .unwrap();
        drop(sender);

        assert!(ChannelBody { receiver }.collect().await.is_err());
    }
}
