//! Core data models for the media relay

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Represents a single byte range from an HTTP `Range` header
///
/// The relay forwards the client's header verbatim; this type exists so the
/// request can be validated and logged in a structured way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive), `None` for `bytes=<start>-`
    pub end: Option<u64>,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if the range is valid
    /// * `Err(RelayError)` if start > end
    pub fn new(start: u64, end: Option<u64>) -> Result<Self> {
        if let Some(end) = end {
            if start > end {
                return Err(RelayError::ParseError(format!(
                    "start ({}) must be <= end ({})",
                    start, end
                )));
            }
        }
        Ok(ByteRange { start, end })
    }

    /// Size of this byte range in bytes, if it is closed
    pub fn size(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// Whether the range runs to the end of the resource
    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }

    /// Parse a ByteRange from an HTTP Range header value
    ///
    /// Accepts `bytes=<start>-<end>` and `bytes=<start>-`.
    pub fn from_header(header: &str) -> Result<Self> {
        let header = header.trim();

        let range_part = header.strip_prefix("bytes=").ok_or_else(|| {
            RelayError::ParseError(format!(
                "Range header must start with 'bytes=', got: {}",
                header
            ))
        })?;

        let (start, end) = range_part.split_once('-').ok_or_else(|| {
            RelayError::ParseError(format!(
                "Invalid range format, expected 'start-[end]', got: {}",
                range_part
            ))
        })?;

        let start = start
            .trim()
            .parse::<u64>()
            .map_err(|e| RelayError::ParseError(format!("Invalid start value: {}", e)))?;

        let end = match end.trim() {
            "" => None,
            value => Some(
                value
                    .parse::<u64>()
                    .map_err(|e| RelayError::ParseError(format!("Invalid end value: {}", e)))?,
            ),
        };

        ByteRange::new(start, end)
    }

    /// Convert this ByteRange to an HTTP Range header value
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// A media id resolved to a playable origin URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMedia {
    pub media_id: String,
    /// Direct origin URL; its validity window is enforced by the origin only
    pub origin_url: String,
    /// Unix timestamp (seconds) at which this answer was produced
    pub resolved_at: u64,
    /// Whether this value was served from the cache
    #[serde(default)]
    pub cached: bool,
}

impl ResolvedMedia {
    pub fn new(media_id: impl Into<String>, origin_url: impl Into<String>, cached: bool) -> Self {
        let resolved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        ResolvedMedia {
            media_id: media_id.into(),
            origin_url: origin_url.into(),
            resolved_at,
            cached,
        }
    }
}

/// One candidate format reported by the extractor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub format_id: Option<String>,
    /// Audio codec, `"none"` for video-only formats
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
}

impl MediaFormat {
    /// Whether this format carries an audio track
    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    /// The direct URL, if present and non-empty
    pub fn usable_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.is_empty())
    }
}

/// Structured description returned by the extraction capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Duration in seconds
    #[serde(default)]
    pub duration: Option<f64>,
    /// Combined best-audio URL when the extractor picked a single format
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub requested_formats: Vec<MediaFormat>,
    #[serde(default)]
    pub formats: Vec<MediaFormat>,
}

/// Lifecycle of a single relay call
///
/// `Resolving` and `Connecting` are passed inside
/// [`StreamRelay::stream`](crate::relay::StreamRelay::stream); a
/// [`RelayBody`](crate::relay::RelayBody) starts in `Streaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Resolving,
    Connecting,
    Streaming,
    Complete,
    Failed,
    Aborted,
}

impl StreamState {
    pub fn label(&self) -> &'static str {
        match self {
            StreamState::Resolving => "resolving",
            StreamState::Connecting => "connecting",
            StreamState::Streaming => "streaming",
            StreamState::Complete => "complete",
            StreamState::Failed => "failed",
            StreamState::Aborted => "aborted",
        }
    }

    /// Whether the upstream connection has been released
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Complete | StreamState::Failed | StreamState::Aborted
        )
    }
}
