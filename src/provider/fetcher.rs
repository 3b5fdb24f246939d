//! Candidate feed fetcher
//!
//! The feed is plain text, one base64-encoded descriptor per line. It is
//! always fetched directly: the local proxy is not up yet when it is needed.

use super::CandidateSource;
use crate::config::ServerDescriptor;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decode a feed body into descriptors.
///
/// Lines that fail to decode are logged and skipped.
pub fn parse_feed(body: &str) -> Vec<ServerDescriptor> {
    let mut descriptors = Vec::new();

    for (index, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match ServerDescriptor::from_line(line) {
            Ok(desc) => {
                debug!("Feed line {}: {}", index + 1, desc);
                descriptors.push(desc);
            }
            Err(e) => warn!("Skipping feed line {}: {}", index + 1, e),
        }
    }

    descriptors
}

/// HTTP feed fetcher
pub struct Fetcher {
    url: String,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(url: String, timeout: Duration) -> Self {
        Fetcher { url, timeout }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the raw feed body
    pub async fn fetch_body(&self) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::fetch(e.to_string()))?;

        let resp = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::fetch(format!("{}: {}", self.url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::fetch(format!("{} returned {}", self.url, status)));
        }

        resp.text()
            .await
            .map_err(|e| Error::fetch(format!("{}: {}", self.url, e)))
    }
}

#[async_trait]
impl CandidateSource for Fetcher {
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>> {
        let body = self.fetch_body().await?;
        let descriptors = parse_feed(&body);

        if descriptors.is_empty() {
            return Err(Error::fetch(format!("{} yielded no usable descriptors", self.url)));
        }

        info!("Fetched {} candidates from {}", descriptors.len(), self.url);
        Ok(descriptors)
    }
}

/// Feed read from a local file, same format as the remote one
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        FileSource { path }
    }
}

#[async_trait]
impl CandidateSource for FileSource {
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::fetch(format!("{}: {}", self.path.display(), e)))?;

        let descriptors = parse_feed(&body);
        if descriptors.is_empty() {
            return Err(Error::fetch(format!(
                "{} yielded no usable descriptors",
                self.path.display()
            )));
        }

        info!("Loaded {} candidates from {}", descriptors.len(), self.path.display());
        Ok(descriptors)
    }
}
