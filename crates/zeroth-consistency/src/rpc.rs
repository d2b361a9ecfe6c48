// RPC adapter of one consensus group
// Wraps outgoing raft messages with the group id and keeps the set of peers the
// group talks to in sync with its configuration

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroth_api::{MessagingService, Verb, send_message};
use zeroth_common::{GroupId, RpcError, ServerAddress, ServerId, ServerInfo};

use crate::address_map::RaftAddressMap;
use crate::server::{MembershipChangeHook, RaftConfiguration};

/// Body of every raft verb: the payload is routed to the server of `group_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftEnvelope<T> {
    pub group_id: GroupId,
    pub from: ServerId,
    pub payload: T,
}

pub struct RaftRpc {
    gid: GroupId,
    my_id: ServerId,
    messaging: Arc<dyn MessagingService>,
    address_map: Arc<RaftAddressMap>,
    on_change: MembershipChangeHook,
    known: Mutex<BTreeMap<ServerId, ServerInfo>>,
}

impl RaftRpc {
    pub fn new(
        gid: GroupId,
        my_id: ServerId,
        messaging: Arc<dyn MessagingService>,
        address_map: Arc<RaftAddressMap>,
        on_change: MembershipChangeHook,
    ) -> Self {
        Self {
            gid,
            my_id,
            messaging,
            address_map,
            on_change,
            known: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.gid
    }

    pub fn my_id(&self) -> ServerId {
        self.my_id
    }

    pub fn address_map(&self) -> &Arc<RaftAddressMap> {
        &self.address_map
    }

    /// Peers currently in the RPC map, self excluded
    pub fn known_servers(&self) -> Vec<ServerAddress> {
        self.known
            .lock()
            .iter()
            .map(|(id, info)| ServerAddress::new(*id, info.clone()))
            .collect()
    }

    /// Reconcile the RPC map with `config`, firing the membership hook for
    /// every peer that entered or left.
    pub fn on_configuration_change(&self, config: &RaftConfiguration) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut departed = Vec::new();
        {
            let mut known = self.known.lock();
            for addr in config.addresses() {
                if addr.id == self.my_id {
                    continue;
                }
                self.address_map.set(addr);
                match known.insert(addr.id, addr.info.clone()) {
                    None => added.push(addr.clone()),
                    Some(previous) if previous != addr.info => {
                        removed.push(ServerAddress::new(addr.id, previous));
                        added.push(addr.clone());
                    }
                    Some(_) => {}
                }
            }

            let current: BTreeSet<ServerId> = config.addresses().map(|addr| addr.id).collect();
            known.retain(|id, info| {
                let keep = current.contains(id);
                if !keep {
                    removed.push(ServerAddress::new(*id, info.clone()));
                    departed.push(*id);
                }
                keep
            });
        }

        // Members that left the configuration must no longer resolve
        for id in departed {
            self.address_map.erase(id);
        }
        for addr in &removed {
            debug!("Group {}: {} left the RPC map", self.gid, addr);
            (self.on_change)(addr, false);
        }
        for addr in &added {
            debug!("Group {}: {} joined the RPC map", self.gid, addr);
            (self.on_change)(addr, true);
        }
    }

    /// Send a raft payload to the server at `to`
    pub async fn send_to<Req, Resp>(
        &self,
        to: &ServerInfo,
        verb: Verb,
        payload: Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let envelope = RaftEnvelope {
            group_id: self.gid,
            from: self.my_id,
            payload,
        };
        send_message(self.messaging.as_ref(), to, verb, &envelope, timeout).await
    }

    /// Send a raft payload to server `target`, resolved through the address map
    pub async fn send<Req, Resp>(
        &self,
        target: ServerId,
        verb: Verb,
        payload: Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let info = self.address_map.find(target).ok_or_else(|| {
            RpcError::Unreachable(target.to_string(), "address unknown".to_string())
        })?;
        self.send_to(&info, verb, payload, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroth_api::{ConfigMember, LocalNetwork};

    fn addr(info: &str) -> ServerAddress {
        ServerAddress::new(ServerId::new_random(), ServerInfo::from(info))
    }

    #[test]
    fn test_configuration_change_fires_hook() {
        let network = LocalNetwork::new();
        let me = addr("a:1");
        let events: Arc<Mutex<Vec<(ServerInfo, bool)>>> = Arc::default();
        let hook: MembershipChangeHook = {
            let events = events.clone();
            Arc::new(move |addr: &ServerAddress, added: bool| {
                events.lock().push((addr.info.clone(), added))
            })
        };
        let address_map = Arc::new(RaftAddressMap::new());
        let rpc = RaftRpc::new(
            GroupId::new_time_ordered(),
            me.id,
            network.join("a:1"),
            address_map.clone(),
            hook,
        );

        let b = addr("b:1");
        let c = addr("c:1");
        rpc.on_configuration_change(&RaftConfiguration::new([
            ConfigMember::voter(me.clone()),
            ConfigMember::non_voter(b.clone()),
        ]));
        assert_eq!(events.lock().clone(), vec![(b.info.clone(), true)]);
        assert_eq!(address_map.find(b.id), Some(b.info.clone()));

        // Unchanged configuration fires nothing
        rpc.on_configuration_change(&RaftConfiguration::new([
            ConfigMember::voter(me.clone()),
            ConfigMember::voter(b.clone()),
        ]));
        assert_eq!(events.lock().len(), 1);

        rpc.on_configuration_change(&RaftConfiguration::new([
            ConfigMember::voter(me.clone()),
            ConfigMember::voter(c.clone()),
        ]));
        assert_eq!(
            events.lock().clone(),
            vec![
                (b.info.clone(), true),
                (b.info.clone(), false),
                (c.info.clone(), true)
            ]
        );
        assert_eq!(rpc.known_servers(), vec![c]);
    }

    #[test]
    fn test_departed_member_is_erased_from_address_map() {
        let network = LocalNetwork::new();
        let me = addr("a:1");
        let address_map = Arc::new(RaftAddressMap::new());
        let rpc = RaftRpc::new(
            GroupId::new_time_ordered(),
            me.id,
            network.join("a:1"),
            address_map.clone(),
            Arc::new(|_: &ServerAddress, _: bool| {}),
        );

        let b = addr("b:1");
        let c = addr("c:1");
        rpc.on_configuration_change(&RaftConfiguration::new([
            ConfigMember::voter(me.clone()),
            ConfigMember::voter(b.clone()),
            ConfigMember::voter(c.clone()),
        ]));
        assert_eq!(address_map.find(b.id), Some(b.info.clone()));

        rpc.on_configuration_change(&RaftConfiguration::new([
            ConfigMember::voter(me.clone()),
            ConfigMember::voter(c.clone()),
        ]));
        assert_eq!(address_map.find(b.id), None);
        assert_eq!(address_map.find(c.id), Some(c.info.clone()));

        // A member that moved keeps its id mapped to the new location
        let moved = ServerAddress::new(c.id, ServerInfo::from("c:2"));
        rpc.on_configuration_change(&RaftConfiguration::new([
            ConfigMember::voter(me.clone()),
            ConfigMember::voter(moved.clone()),
        ]));
        assert_eq!(address_map.find(c.id), Some(moved.info.clone()));

        // The local entry is never touched
        assert_eq!(address_map.find(me.id), None);
    }
}
