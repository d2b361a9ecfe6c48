// Registry of running consensus groups on this node
// Owns every started server bundle, the group 0 shortcut, the shared address map
// and the direct failure detector

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeroth_common::{GroupId, Result, ZerothError};

use crate::address_map::RaftAddressMap;
use crate::failure_detector::DirectFailureDetector;
use crate::server::{RaftConfiguration, RaftServer, RaftServerForGroup};

pub struct RaftGroupRegistry {
    enabled: bool,
    servers: DashMap<GroupId, Arc<RaftServerForGroup>>,
    group0_id: RwLock<Option<GroupId>>,
    address_map: Arc<RaftAddressMap>,
    direct_fd: Arc<DirectFailureDetector>,
    stop: CancellationToken,
}

impl RaftGroupRegistry {
    pub fn new(
        enabled: bool,
        address_map: Arc<RaftAddressMap>,
        direct_fd: Arc<DirectFailureDetector>,
    ) -> Self {
        Self {
            enabled,
            servers: DashMap::new(),
            group0_id: RwLock::new(None),
            address_map,
            direct_fd,
            stop: CancellationToken::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn address_map(&self) -> &Arc<RaftAddressMap> {
        &self.address_map
    }

    pub fn direct_fd(&self) -> &Arc<DirectFailureDetector> {
        &self.direct_fd
    }

    /// Start the bundle's server, arm its ticker and take ownership of it
    pub async fn start_server_for_group(&self, bundle: RaftServerForGroup) -> Result<()> {
        let gid = bundle.gid;
        if self.servers.contains_key(&gid) {
            return Err(ZerothError::Internal(format!(
                "server for group {} is already running",
                gid
            )));
        }

        bundle.server.start().await?;
        bundle.ticker.arm(
            bundle.server.clone(),
            bundle.rpc.clone(),
            self.stop.child_token(),
        );
        info!(
            "Started server {} for group {} (tick interval {:?})",
            bundle.server.id(),
            gid,
            bundle.ticker.interval()
        );
        self.servers.insert(gid, Arc::new(bundle));
        Ok(())
    }

    /// Stop the server of `gid` and forget it. Peers it tracked leave the
    /// address map and the failure detector.
    pub async fn stop_server_for_group(&self, gid: GroupId) {
        let Some((_, bundle)) = self.servers.remove(&gid) else {
            return;
        };
        bundle.ticker.cancel();
        if let Err(e) = bundle.server.abort().await {
            warn!("Failed to abort server for group {}: {}", gid, e);
        }
        bundle.rpc.on_configuration_change(&RaftConfiguration::default());
        if self.group0_id() == Some(gid) {
            *self.group0_id.write() = None;
        }
        info!("Stopped server {} for group {}", bundle.server.id(), gid);
    }

    pub fn set_group0_id(&self, gid: GroupId) {
        *self.group0_id.write() = Some(gid);
    }

    pub fn group0_id(&self) -> Option<GroupId> {
        *self.group0_id.read()
    }

    pub fn get_server(&self, gid: GroupId) -> Result<Arc<dyn RaftServer>> {
        self.servers
            .get(&gid)
            .map(|bundle| bundle.server.clone())
            .ok_or_else(|| ZerothError::UnknownGroup(gid.to_string()))
    }

    pub fn group0(&self) -> Result<Arc<dyn RaftServer>> {
        let gid = self
            .group0_id()
            .ok_or_else(|| ZerothError::Internal("group 0 is not set".to_string()))?;
        self.get_server(gid)
    }

    pub fn group_count(&self) -> usize {
        self.servers.len()
    }

    /// Stop every ticker and abort every server
    pub async fn abort(&self) {
        self.stop.cancel();
        let bundles: Vec<Arc<RaftServerForGroup>> =
            self.servers.iter().map(|entry| entry.value().clone()).collect();
        self.servers.clear();

        for bundle in bundles {
            bundle.ticker.cancel();
            if let Err(e) = bundle.server.abort().await {
                warn!("Failed to abort server for group {}: {}", bundle.gid, e);
            }
        }
    }
}
