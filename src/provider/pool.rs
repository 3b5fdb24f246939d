//! Latency ranking of candidate servers
//!
//! Every candidate is probed concurrently, so a round costs one probe timeout
//! no matter how many candidates the feed carries.

use crate::common::net::tcp_connect_latency;
use crate::config::ServerDescriptor;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default per-probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Latency probe strategy
#[async_trait]
pub trait Probe: Send + Sync {
    /// Measure round-trip latency to the candidate
    async fn probe(&self, descriptor: &ServerDescriptor) -> Result<Duration>;
}

/// Raw TCP connect probe
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, descriptor: &ServerDescriptor) -> Result<Duration> {
        // The pool applies the real deadline; this one only guards direct callers.
        tcp_connect_latency(&descriptor.host, descriptor.port, Duration::from_secs(30)).await
    }
}

/// Outcome of probing one candidate; `latency` is `None` when unreachable
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub descriptor: ServerDescriptor,
    pub latency: Option<Duration>,
}

impl ProbeResult {
    pub fn is_reachable(&self) -> bool {
        self.latency.is_some()
    }
}

/// Concurrent prober and ranker
pub struct ServerPool {
    probe: Arc<dyn Probe>,
    timeout: Duration,
}

impl ServerPool {
    pub fn new(probe: Arc<dyn Probe>, timeout: Duration) -> Self {
        ServerPool { probe, timeout }
    }

    /// TCP connect probing with the given per-probe timeout
    pub fn tcp(timeout: Duration) -> Self {
        Self::new(Arc::new(TcpProbe), timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe every descriptor concurrently, one result per input in input order
    pub async fn probe_all(&self, descriptors: &[ServerDescriptor]) -> Vec<ProbeResult> {
        let futures: Vec<_> = descriptors
            .iter()
            .map(|desc| {
                let probe = self.probe.clone();
                let limit = self.timeout;

                async move {
                    let latency = match timeout(limit, probe.probe(desc)).await {
                        Ok(Ok(latency)) => Some(latency),
                        Ok(Err(e)) => {
                            debug!("Probe {} failed: {}", desc, e);
                            None
                        }
                        Err(_) => {
                            debug!("Probe {} timed out after {:?}", desc, limit);
                            None
                        }
                    };
                    ProbeResult {
                        descriptor: desc.clone(),
                        latency,
                    }
                }
            })
            .collect();

        futures::future::join_all(futures).await
    }

    /// Reachable candidates, lowest latency first.
    ///
    /// Equal latencies keep their input order.
    pub async fn rank(&self, descriptors: &[ServerDescriptor]) -> Vec<ServerDescriptor> {
        let results = self.probe_all(descriptors).await;
        let ranked = rank_results(results);

        info!(
            "Ranked {}/{} reachable candidates",
            ranked.len(),
            descriptors.len()
        );
        for (i, (desc, latency)) in ranked.iter().enumerate() {
            debug!("  #{} {} {}ms", i + 1, desc, latency.as_millis());
        }

        ranked.into_iter().map(|(desc, _)| desc).collect()
    }

    /// Only the lowest-latency candidate
    pub async fn best(&self, descriptors: &[ServerDescriptor]) -> Option<ServerDescriptor> {
        self.rank(descriptors).await.into_iter().next()
    }
}

/// Drop unreachable results and sort the rest by latency (stable)
pub fn rank_results(results: Vec<ProbeResult>) -> Vec<(ServerDescriptor, Duration)> {
    let mut reachable: Vec<(ServerDescriptor, Duration)> = results
        .into_iter()
        .filter_map(|r| r.latency.map(|latency| (r.descriptor, latency)))
        .collect();
    reachable.sort_by_key(|(_, latency)| *latency);
    reachable
}
