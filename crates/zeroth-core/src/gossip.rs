// Seed and liveness services consumed by group 0
// The gossiper supplies the configured seed locations, this node's broadcast
// location and the pinger used by the direct failure detector

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::trace;
use zeroth_api::{MessageHandler, MessagingService, Verb, send_message};
use zeroth_common::ServerInfo;
use zeroth_consistency::{EndpointId, Pinger};

/// Source of the locations group 0 bootstraps from
pub trait Gossiper: Send + Sync {
    /// Configured seed locations, possibly including this node
    fn seeds(&self) -> Vec<ServerInfo>;

    /// Location other nodes reach this node at
    fn broadcast_address(&self) -> ServerInfo;

    fn direct_fd_pinger(&self) -> Arc<DirectFdPinger>;
}

/// Gossiper over a fixed seed list
pub struct StaticGossiper {
    seeds: Vec<ServerInfo>,
    broadcast: ServerInfo,
    pinger: Arc<DirectFdPinger>,
}

impl StaticGossiper {
    pub fn new(
        seeds: Vec<ServerInfo>,
        broadcast: ServerInfo,
        messaging: Arc<dyn MessagingService>,
    ) -> Self {
        Self {
            seeds,
            broadcast,
            pinger: Arc::new(DirectFdPinger::new(messaging)),
        }
    }
}

impl Gossiper for StaticGossiper {
    fn seeds(&self) -> Vec<ServerInfo> {
        self.seeds.clone()
    }

    fn broadcast_address(&self) -> ServerInfo {
        self.broadcast.clone()
    }

    fn direct_fd_pinger(&self) -> Arc<DirectFdPinger> {
        self.pinger.clone()
    }
}

/// Pings peers by endpoint id over `direct_fd_ping`.
///
/// Endpoint ids are allocated per location and never reused, so a location
/// keeps its id across leaving and re-entering the RPC map.
pub struct DirectFdPinger {
    messaging: Arc<dyn MessagingService>,
    ids: DashMap<ServerInfo, EndpointId>,
    endpoints: DashMap<EndpointId, ServerInfo>,
    next_id: AtomicU64,
}

impl DirectFdPinger {
    pub fn new(messaging: Arc<dyn MessagingService>) -> Self {
        Self {
            messaging,
            ids: DashMap::new(),
            endpoints: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_id(&self, info: &ServerInfo) -> EndpointId {
        *self.ids.entry(info.clone()).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.endpoints.insert(id, info.clone());
            id
        })
    }

    pub fn endpoint_info(&self, endpoint: EndpointId) -> Option<ServerInfo> {
        self.endpoints.get(&endpoint).map(|info| info.value().clone())
    }
}

#[async_trait::async_trait]
impl Pinger for DirectFdPinger {
    async fn ping(&self, endpoint: EndpointId, timeout: Duration) -> bool {
        let Some(info) = self.endpoint_info(endpoint) else {
            return false;
        };
        match send_message::<_, ()>(
            self.messaging.as_ref(),
            &info,
            Verb::DirectFdPing,
            &(),
            timeout,
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                trace!("ping {} failed: {}", info, e);
                false
            }
        }
    }
}

struct PingHandler;

#[async_trait::async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, _body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&())?)
    }
}

/// Answer `direct_fd_ping` on this node
pub fn register_ping_handler(messaging: &dyn MessagingService) {
    messaging
        .handlers()
        .register(Verb::DirectFdPing, Arc::new(PingHandler));
}
