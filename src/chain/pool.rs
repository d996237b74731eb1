// src/chain/pool.rs
use crate::chain::client::{ChainClient, ClientFactory};
use crate::error::{DispatchError, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// One candidate network access point with its last observed health.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub healthy: bool,
    pub last_checked: Option<Instant>,
}

impl Endpoint {
    fn new(url: String) -> Self {
        Self {
            url,
            healthy: false,
            last_checked: None,
        }
    }

    fn fresh_within(&self, window: Duration) -> bool {
        self.healthy && self.last_checked.map_or(false, |t| t.elapsed() < window)
    }
}

struct PoolState {
    endpoints: Vec<Endpoint>,
    clients: Vec<Option<Arc<dyn ChainClient>>>,
    current: usize,
    failovers: u64,
}

/// Health-probed endpoint pool with round-robin failover.
///
/// Callers must not assume endpoint stability across calls: a failed probe
/// silently moves the pool to the next endpoint.
pub struct EndpointPool {
    state: Mutex<PoolState>,
    factory: Arc<dyn ClientFactory>,
    freshness: Duration,
    probe_timeout: Duration,
}

impl EndpointPool {
    pub fn new(
        urls: Vec<String>,
        factory: Arc<dyn ClientFactory>,
        freshness: Duration,
        probe_timeout: Duration,
    ) -> Self {
        info!("Initialized endpoint pool with {} endpoints", urls.len());
        let count = urls.len();
        Self {
            state: Mutex::new(PoolState {
                endpoints: urls.into_iter().map(Endpoint::new).collect(),
                clients: (0..count).map(|_| None).collect(),
                current: 0,
                failovers: 0,
            }),
            factory,
            freshness,
            probe_timeout,
        }
    }

    /// Returns a connected client. The current endpoint is reused while its
    /// last successful probe is inside the freshness window; otherwise the
    /// pool round-robins through the list probing each endpoint. If every
    /// probe fails the pool falls back to the last endpoint it probed rather
    /// than failing outright, leaving the per-unit failure path to absorb
    /// whatever happens next.
    pub async fn get_connection(&self) -> Result<Arc<dyn ChainClient>> {
        let mut state = self.state.lock().await;

        if state.endpoints.is_empty() {
            return Err(DispatchError::FatalConfig(
                "endpoint pool configured with no endpoints".to_string(),
            ));
        }

        let current = state.current;
        if state.endpoints[current].fresh_within(self.freshness) {
            if let Some(client) = state.clients[current].clone() {
                return Ok(client);
            }
        }

        let count = state.endpoints.len();
        let mut last_probed: Option<usize> = None;

        for offset in 0..count {
            let idx = (current + offset) % count;
            let url = state.endpoints[idx].url.clone();

            let client = match state.clients[idx].clone() {
                Some(c) => c,
                None => match self.factory.create(&url) {
                    Ok(c) => {
                        state.clients[idx] = Some(c.clone());
                        c
                    }
                    Err(e) => {
                        warn!("Failed to construct client for {}: {}", url, e);
                        state.endpoints[idx].healthy = false;
                        state.endpoints[idx].last_checked = Some(Instant::now());
                        continue;
                    }
                },
            };

            last_probed = Some(idx);
            match timeout(self.probe_timeout, client.latest_block()).await {
                Ok(Ok(block)) => {
                    state.endpoints[idx].healthy = true;
                    state.endpoints[idx].last_checked = Some(Instant::now());
                    if idx != current {
                        state.failovers += 1;
                        info!("Failed over to endpoint {} (block {})", url, block);
                    } else {
                        debug!("Endpoint {} healthy at block {}", url, block);
                    }
                    state.current = idx;
                    return Ok(client);
                }
                Ok(Err(e)) => {
                    warn!("Probe failed for {}: {}", url, e);
                }
                Err(_) => {
                    warn!("Probe timed out for {} after {:?}", url, self.probe_timeout);
                }
            }
            state.endpoints[idx].healthy = false;
            state.endpoints[idx].last_checked = Some(Instant::now());
        }

        // Best-effort fallback: a likely-failing attempt beats a hard stall
        // for bulk work, and the caller records the unit failure either way.
        if let Some(idx) = last_probed {
            let url = state.endpoints[idx].url.clone();
            warn!(
                "All {} endpoints failed probes; falling back to last probed {}",
                count, url
            );
            state.current = idx;
            if let Some(client) = state.clients[idx].clone() {
                return Ok(client);
            }
        }

        Err(DispatchError::Connectivity {
            endpoint: "*".to_string(),
            message: "no endpoint could be probed or constructed".to_string(),
        })
    }

    /// Marks an endpoint unhealthy so the next `get_connection` re-probes.
    /// Called by the pipeline when a broadcast fails with a connectivity
    /// error mid-flight.
    pub async fn report_failure(&self, url: &str) {
        let mut state = self.state.lock().await;
        if let Some(ep) = state.endpoints.iter_mut().find(|e| e.url == url) {
            ep.healthy = false;
            warn!("Endpoint {} reported failed by caller", url);
        }
    }

    /// Probes every endpoint once, regardless of cached health. Diagnostic
    /// surface for the CLI; does not disturb the pool's current selection.
    pub async fn probe_all(&self) -> Vec<EndpointProbe> {
        let urls: Vec<String> = {
            let state = self.state.lock().await;
            state.endpoints.iter().map(|e| e.url.clone()).collect()
        };

        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            let started = Instant::now();
            let probe = match self.factory.create(&url) {
                Ok(client) => match timeout(self.probe_timeout, client.latest_block()).await {
                    Ok(Ok(block)) => EndpointProbe {
                        url: url.clone(),
                        online: true,
                        latency_ms: Some(started.elapsed().as_millis() as u64),
                        block: Some(block),
                        error: None,
                    },
                    Ok(Err(e)) => EndpointProbe::offline(url.clone(), e.to_string()),
                    Err(_) => EndpointProbe::offline(url.clone(), "probe timed out".to_string()),
                },
                Err(e) => EndpointProbe::offline(url.clone(), e.to_string()),
            };
            results.push(probe);
        }
        results
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            total_endpoints: state.endpoints.len(),
            healthy_endpoints: state.endpoints.iter().filter(|e| e.healthy).count(),
            current_endpoint: state
                .endpoints
                .get(state.current)
                .map(|e| e.url.clone())
                .unwrap_or_default(),
            failovers: state.failovers,
        }
    }
}

/// Result of a single diagnostic probe.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointProbe {
    pub url: String,
    pub online: bool,
    pub latency_ms: Option<u64>,
    pub block: Option<u64>,
    pub error: Option<String>,
}

impl EndpointProbe {
    fn offline(url: String, error: String) -> Self {
        Self {
            url,
            online: false,
            latency_ms: None,
            block: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub current_endpoint: String,
    pub failovers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockChainClient, MockChainFactory};

    fn pool_with(factory: MockChainFactory, urls: &[&str]) -> EndpointPool {
        EndpointPool::new(
            urls.iter().map(|s| s.to_string()).collect(),
            Arc::new(factory),
            Duration::from_secs(30),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn skips_endpoint_with_failed_probe() {
        let factory = MockChainFactory::new();
        factory.register("http://a", MockChainClient::new("http://a").with_probe_failures(usize::MAX));
        factory.register("http://b", MockChainClient::new("http://b"));

        let pool = pool_with(factory, &["http://a", "http://b"]);
        let client = pool.get_connection().await.unwrap();
        assert_eq!(client.endpoint(), "http://b");

        let stats = pool.stats().await;
        assert_eq!(stats.healthy_endpoints, 1);
        assert_eq!(stats.current_endpoint, "http://b");
    }

    #[tokio::test]
    async fn reuses_fresh_endpoint_without_reprobing() {
        let factory = MockChainFactory::new();
        let client = MockChainClient::new("http://a");
        factory.register("http://a", client.clone());

        let pool = pool_with(factory, &["http://a"]);
        pool.get_connection().await.unwrap();
        pool.get_connection().await.unwrap();
        // One probe for the first call; the second call hits the freshness
        // window and must not probe again.
        assert_eq!(client.probe_count(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_last_probed_when_all_fail() {
        let factory = MockChainFactory::new();
        factory.register("http://a", MockChainClient::new("http://a").with_probe_failures(usize::MAX));
        factory.register("http://b", MockChainClient::new("http://b").with_probe_failures(usize::MAX));

        let pool = pool_with(factory, &["http://a", "http://b"]);
        let client = pool.get_connection().await.unwrap();
        assert_eq!(client.endpoint(), "http://b");
    }
}
