//! Candidate providers
//!
//! Where candidates come from (`CandidateSource`) and how they are ranked
//! (`ServerPool`).

mod fetcher;
mod pool;

pub use fetcher::{parse_feed, FileSource, Fetcher};
pub use pool::{
    rank_results, Probe, ProbeResult, ServerPool, TcpProbe, DEFAULT_PROBE_TIMEOUT,
};

use crate::config::{Config, ServerDescriptor};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Source of candidate descriptors
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Fetch and decode the current candidate list
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>>;
}

/// Fixed candidate list
pub struct StaticSource {
    descriptors: Vec<ServerDescriptor>,
}

impl StaticSource {
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Self {
        StaticSource { descriptors }
    }
}

#[async_trait]
impl CandidateSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>> {
        if self.descriptors.is_empty() {
            return Err(Error::fetch("static candidate list is empty"));
        }
        Ok(self.descriptors.clone())
    }
}

/// Build the source selected by the configuration
pub fn source_from_config(config: &Config) -> Result<Arc<dyn CandidateSource>> {
    if let Some(ref path) = config.feed_file {
        return Ok(Arc::new(FileSource::new(path.clone())));
    }

    match config.feed_url {
        Some(ref url) => Ok(Arc::new(Fetcher::new(url.clone(), config.fetch_timeout()))),
        None => Err(Error::config("no candidate feed configured")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_empty() {
        let source = StaticSource::new(Vec::new());
        assert!(matches!(source.fetch().await, Err(Error::Fetch(_))));
    }

    #[test]
    fn test_source_from_config() {
        let config = Config {
            feed_url: Some("https://feed.example.com/".to_string()),
            ..Default::default()
        };
        assert!(source_from_config(&config).is_ok());
        assert!(source_from_config(&Config::default()).is_err());
    }

    #[test]
    fn test_file_source_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let feed = dir.path().join("feed.txt");
        std::fs::write(&feed, "not-base64\n").unwrap();

        let config = Config {
            feed_url: Some("https://feed.example.com/".to_string()),
            feed_file: Some(feed),
            ..Default::default()
        };
        let source = source_from_config(&config).unwrap();
        // Only the file is read, and it has no usable line
        let fetched = tokio_test::block_on(source.fetch());
        assert!(matches!(fetched, Err(Error::Fetch(_))));
    }
}
