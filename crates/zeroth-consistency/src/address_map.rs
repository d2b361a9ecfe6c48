// Raft server id to location mapping
// Shared by all groups on a node; filled from configurations and from group 0 setup

use dashmap::DashMap;
use tracing::debug;
use zeroth_common::{Result, ServerAddress, ServerId, ServerInfo, ZerothError};

#[derive(Default)]
pub struct RaftAddressMap {
    entries: DashMap<ServerId, ServerInfo>,
}

impl RaftAddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, addr: &ServerAddress) {
        let previous = self.entries.insert(addr.id, addr.info.clone());
        if previous.as_ref() != Some(&addr.info) {
            debug!("Address map: {} -> {}", addr.id, addr.info);
        }
    }

    pub fn erase(&self, id: ServerId) -> Option<ServerInfo> {
        self.entries.remove(&id).map(|(_, info)| info)
    }

    pub fn find(&self, id: ServerId) -> Option<ServerInfo> {
        self.entries.get(&id).map(|info| info.value().clone())
    }

    /// Id of the server at `info`, ignoring `exclude`. Used when a node at a
    /// known location is removed and possibly replaced.
    pub fn find_replace_id(&self, info: &ServerInfo, exclude: ServerId) -> Option<ServerId> {
        self.entries
            .iter()
            .find(|entry| entry.value() == info && *entry.key() != exclude)
            .map(|entry| *entry.key())
    }

    pub fn get_server_address(&self, id: ServerId) -> Result<ServerAddress> {
        self.find(id)
            .map(|info| ServerAddress::new(id, info))
            .ok_or_else(|| ZerothError::Internal(format!("no address known for server {}", id)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
