//! Error types for the media relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error types that can occur while resolving or relaying media
///
/// Cache failures never appear here: they are absorbed by
/// [`TieredCache`](crate::tiered_cache::TieredCache) and reported through
/// [`CacheEvent`](crate::tiered_cache::CacheEvent) instead.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid media id: {0:?}")]
    InvalidMediaId(String),

    #[error("No playable format found: {0}")]
    ResolutionNotFound(String),

    #[error("Extractor error: {0}")]
    ExtractorError(String),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout(err.to_string())
        } else {
            RelayError::UpstreamConnect(err.to_string())
        }
    }
}

impl RelayError {
    /// Convert error to HTTP status code
    ///
    /// - Resolution failures map to 404
    /// - Connection failures map to 502, timeouts to 504
    /// - Malformed media ids map to 400
    /// - Everything else is a 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            RelayError::InvalidMediaId(_) => 400,
            RelayError::ResolutionNotFound(_) => 404,
            RelayError::UpstreamConnect(_) => 502,
            RelayError::Timeout(_) => 504,
            RelayError::ConfigError(_) => 500,
            RelayError::ExtractorError(_) => 500,
            RelayError::ParseError(_) => 500,
            RelayError::IoError(_) => 500,
            RelayError::InternalError(_) => 500,
        }
    }

    /// Stable machine-readable code used in JSON error bodies
    pub fn error_code(&self) -> &'static str {
        match self {
            RelayError::InvalidMediaId(_) => "INVALID_MEDIA_ID",
            RelayError::ResolutionNotFound(_) => "NOT_FOUND",
            RelayError::UpstreamConnect(_) => "STREAM_ERROR",
            RelayError::Timeout(_) => "UPSTREAM_TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }
}
