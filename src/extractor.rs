//! Format extraction capability
//!
//! Given a canonical watch URL, an extractor returns the structured list of
//! candidate formats ([`ExtractedInfo`]). The production implementation drives the
//! `yt-dlp` command line tool and parses its JSON dump.

use crate::config::ExtractorConfig;
use crate::error::{RelayError, Result};
use crate::models::ExtractedInfo;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Anything able to enumerate playable formats for a watch URL
#[async_trait]
pub trait FormatExtractor: Send + Sync {
    async fn extract(&self, watch_url: &str) -> Result<ExtractedInfo>;
}

/// Builds one extractor per worker
pub type ExtractorFactory = Arc<dyn Fn() -> Arc<dyn FormatExtractor> + Send + Sync>;

/// Extractor backed by the `yt-dlp` executable
///
/// Each instance carries a fixed format preference and client negotiation profile.
#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    program: String,
    format: String,
    player_clients: Vec<String>,
    timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        YtDlpExtractor {
            program: config.program.clone(),
            format: config.format.clone(),
            player_clients: config.player_clients.clone(),
            timeout: config.timeout(),
        }
    }

    /// Factory producing a fresh extractor configured from `config`
    pub fn factory(config: &ExtractorConfig) -> ExtractorFactory {
        let config = config.clone();
        Arc::new(move || Arc::new(YtDlpExtractor::new(&config)) as Arc<dyn FormatExtractor>)
    }

    /// Command line arguments for a single extraction
    pub fn args(&self, watch_url: &str) -> Vec<String> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--no-warnings".to_string(),
            "--quiet".to_string(),
            "--skip-download".to_string(),
            "--no-playlist".to_string(),
            "--force-ipv4".to_string(),
            "--format".to_string(),
            self.format.clone(),
        ];
        if !self.player_clients.is_empty() {
            args.push("--extractor-args".to_string());
            args.push(format!(
                "youtube:player_client={}",
                self.player_clients.join(",")
            ));
        }
        args.push(watch_url.to_string());
        args
    }
}

#[async_trait]
impl FormatExtractor for YtDlpExtractor {
    async fn extract(&self, watch_url: &str) -> Result<ExtractedInfo> {
        debug!("Running {} for url={}", self.program, watch_url);

        let child = Command::new(&self.program)
            .args(self.args(watch_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::ExtractorError(format!("failed to spawn {}: {}", self.program, e))
            })?;

        // kill_on_drop reaps the child if the timeout cancels the wait
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RelayError::ExtractorError(format!(
                    "I/O error waiting for {}: {}",
                    self.program, e
                )))
            }
            Err(_) => {
                warn!("{} timed out after {:?} for url={}", self.program, self.timeout, watch_url);
                return Err(RelayError::Timeout(format!(
                    "{} timed out after {:?}",
                    self.program, self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::ExtractorError(format!(
                "{} exited with status {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let info: ExtractedInfo = serde_json::from_slice(&output.stdout)?;
        debug!(
            "Extracted url={}: requested_formats={}, formats={}",
            watch_url,
            info.requested_formats.len(),
            info.formats.len()
        );
        Ok(info)
    }
}
