// Direct failure detector
// Pings every tracked endpoint on a fixed interval and records liveness. The set
// of endpoints follows group 0 membership through the RPC map hook.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Endpoint handle allocated by the pinger for a peer location
pub type EndpointId = u64;

/// Sends one liveness ping
#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, endpoint: EndpointId, timeout: Duration) -> bool;
}

#[derive(Clone, Debug)]
pub struct FailureDetectorConfig {
    /// Interval between ping rounds
    pub ping_interval: Duration,
    /// Deadline of a single ping
    pub ping_timeout: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(300),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct EndpointState {
    alive: bool,
    last_seen: Option<Instant>,
}

pub struct DirectFailureDetector {
    config: FailureDetectorConfig,
    endpoints: DashMap<EndpointId, EndpointState>,
}

impl DirectFailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            config,
            endpoints: DashMap::new(),
        }
    }

    pub fn add_endpoint(&self, endpoint: EndpointId) {
        self.endpoints.entry(endpoint).or_default();
    }

    pub fn remove_endpoint(&self, endpoint: EndpointId) {
        self.endpoints.remove(&endpoint);
    }

    pub fn is_tracked(&self, endpoint: EndpointId) -> bool {
        self.endpoints.contains_key(&endpoint)
    }

    pub fn is_alive(&self, endpoint: EndpointId) -> bool {
        self.endpoints.get(&endpoint).is_some_and(|state| state.alive)
    }

    /// Time since the endpoint last answered a ping
    pub fn last_seen(&self, endpoint: EndpointId) -> Option<Duration> {
        self.endpoints
            .get(&endpoint)
            .and_then(|state| state.last_seen)
            .map(|seen| seen.elapsed())
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.endpoints.iter().map(|entry| *entry.key()).collect()
    }

    /// Ping every tracked endpoint once
    pub async fn ping_round(&self, pinger: &dyn Pinger) {
        let endpoints = self.endpoints();
        let results = join_all(
            endpoints
                .iter()
                .map(|endpoint| pinger.ping(*endpoint, self.config.ping_timeout)),
        )
        .await;

        for (endpoint, alive) in endpoints.into_iter().zip(results) {
            // Endpoints removed while the round was in flight stay removed.
            if let Some(mut state) = self.endpoints.get_mut(&endpoint) {
                if state.alive != alive {
                    info!(
                        endpoint,
                        "Endpoint is now {}",
                        if alive { "alive" } else { "dead" }
                    );
                }
                state.alive = alive;
                if alive {
                    state.last_seen = Some(Instant::now());
                }
            }
        }
    }

    /// Ping on the configured interval until `stop` is cancelled
    pub async fn run(self: Arc<Self>, pinger: Arc<dyn Pinger>, stop: CancellationToken) {
        let mut timer = tokio::time::interval(self.config.ping_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = timer.tick() => self.ping_round(pinger.as_ref()).await,
            }
        }
        debug!("Direct failure detector stopped");
    }
}
