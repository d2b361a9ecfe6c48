// Consensus server backed by openraft
// Implements the engine boundary for one group and the factory that builds them

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use openraft::error::{InitializeError, RaftError};
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use openraft::{BasicNode, ChangeMembers, ServerState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroth_api::{ConfigMember, MessageHandler, MessagingService, Verb};
use zeroth_common::{GroupId, Result, ServerAddress, ServerId, ServerInfo, ZerothError};

use super::config::RaftConfig;
use super::log_store::{RocksLogStore, RocksRaftPersistence};
use super::network::{OpenRaftNetworkFactory, RaftReply};
use super::state_machine::{Group0StateMachine, MetadataReader};
use super::types::{Group0Command, Group0Response, Raft, RaftMetrics, TypeConfig};
use crate::address_map::RaftAddressMap;
use crate::rpc::{RaftEnvelope, RaftRpc};
use crate::server::{
    MembershipChangeHook, RaftConfiguration, RaftServer, RaftServerFactory, RaftServerForGroup,
    RaftTicker,
};

/// How long `start` waits for a freshly initialized server to see itself in
/// the configuration
const BOOTSTRAP_WAIT: Duration = Duration::from_secs(10);

fn raft_error(e: impl std::fmt::Display) -> ZerothError {
    ZerothError::Raft(e.to_string())
}

/// Membership change forwarded to the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyConfigForward {
    pub add: Vec<ConfigMember>,
    pub del: Vec<ServerId>,
}

/// Consensus server of one group
pub struct OpenRaftServer {
    id: ServerId,
    gid: GroupId,
    raft: Raft,
    rpc: Arc<RaftRpc>,
    persistence: RocksRaftPersistence,
    metadata: MetadataReader,
    rpc_timeout: Duration,
}

impl OpenRaftServer {
    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.metrics().state, ServerState::Leader)
    }

    /// Applied group 0 metadata on this server
    pub fn metadata(&self) -> &MetadataReader {
        &self.metadata
    }

    /// Replicate a metadata command. Must run on the leader.
    pub async fn client_write(&self, command: Group0Command) -> Result<Group0Response> {
        debug!("Writing through group {}: {}", self.gid, command.op_type());
        let result = self.raft.client_write(command).await.map_err(raft_error)?;
        Ok(result.data)
    }

    /// Apply a membership change locally. The caller has checked leadership;
    /// openraft rejects the change with `ForwardToLeader` if it was lost since.
    async fn change_membership_as_leader(
        &self,
        add: Vec<ConfigMember>,
        del: Vec<ServerId>,
    ) -> Result<()> {
        let current = self.get_configuration();

        for member in &add {
            if !current.contains(member.addr.id) {
                info!("Group {}: adding {} as learner", self.gid, member.addr);
                self.raft
                    .add_learner(
                        member.addr.id,
                        BasicNode::new(member.addr.info.as_str()),
                        true,
                    )
                    .await
                    .map_err(raft_error)?;
            }
        }

        let promote: BTreeSet<ServerId> = add
            .iter()
            .filter(|member| member.can_vote && !current.can_vote(member.addr.id))
            .map(|member| member.addr.id)
            .collect();
        if !promote.is_empty() {
            info!("Group {}: promoting {:?} to voters", self.gid, promote);
            self.raft
                .change_membership(ChangeMembers::AddVoterIds(promote), false)
                .await
                .map_err(raft_error)?;
        }

        let demote: BTreeSet<ServerId> = add
            .iter()
            .filter(|member| !member.can_vote && current.can_vote(member.addr.id))
            .map(|member| member.addr.id)
            .collect();
        if !demote.is_empty() {
            info!("Group {}: demoting {:?} to learners", self.gid, demote);
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(demote), true)
                .await
                .map_err(raft_error)?;
        }

        let current = self.get_configuration();
        let (remove_voters, remove_learners): (BTreeSet<ServerId>, BTreeSet<ServerId>) = del
            .iter()
            .copied()
            .filter(|id| current.contains(*id))
            .partition(|id| current.can_vote(*id));
        if !remove_voters.is_empty() {
            info!("Group {}: removing voters {:?}", self.gid, remove_voters);
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(remove_voters), false)
                .await
                .map_err(raft_error)?;
        }
        if !remove_learners.is_empty() {
            info!("Group {}: removing learners {:?}", self.gid, remove_learners);
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(remove_learners), false)
                .await
                .map_err(raft_error)?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl RaftServer for OpenRaftServer {
    fn id(&self) -> ServerId {
        self.id
    }

    async fn start(&self) -> Result<()> {
        let Some(initial) = self.persistence.load_bootstrap()? else {
            debug!("Group {}: resuming from the existing log", self.gid);
            return Ok(());
        };

        let voters: BTreeMap<ServerId, BasicNode> = initial
            .voters()
            .map(|member| (member.addr.id, BasicNode::new(member.addr.info.as_str())))
            .collect();
        if voters.is_empty() {
            info!(
                "Group {}: started without a configuration, waiting to be added",
                self.gid
            );
            return Ok(());
        }

        match self.raft.initialize(voters).await {
            Ok(()) => {
                info!("Group {}: initialized as founder", self.gid);
                let id = self.id;
                self.raft
                    .wait(Some(BOOTSTRAP_WAIT))
                    .metrics(
                        move |m| m.membership_config.membership().get_node(&id).is_some(),
                        "initial configuration applied",
                    )
                    .await
                    .map_err(raft_error)?;
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!("Group {}: already initialized", self.gid);
            }
            Err(e) => return Err(raft_error(e)),
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        info!("Shutting down raft server {} of group {}", self.id, self.gid);
        self.raft.shutdown().await.map_err(raft_error)
    }

    /// openraft drives its own election and heartbeat timers
    fn tick(&self) {}

    fn get_configuration(&self) -> RaftConfiguration {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<ServerId> = membership.voter_ids().collect();
        RaftConfiguration::new(membership.nodes().map(|(id, node)| ConfigMember {
            addr: ServerAddress::new(*id, ServerInfo::from(node.addr.as_str())),
            can_vote: voters.contains(id),
        }))
    }

    async fn modify_config(&self, add: Vec<ConfigMember>, del: Vec<ServerId>) -> Result<()> {
        match self.raft.current_leader().await {
            Some(leader) if leader == self.id => self.change_membership_as_leader(add, del).await,
            Some(leader) => {
                debug!("Group {}: forwarding membership change to {}", self.gid, leader);
                let reply: std::result::Result<(), String> = self
                    .rpc
                    .send(
                        leader,
                        Verb::RaftModifyConfig,
                        ModifyConfigForward { add, del },
                        self.rpc_timeout,
                    )
                    .await?;
                reply.map_err(ZerothError::Raft)
            }
            None => Err(ZerothError::Raft(format!(
                "group {} has no leader",
                self.gid
            ))),
        }
    }
}

type ServerMap = DashMap<GroupId, Arc<OpenRaftServer>>;

/// Inbound raft verbs, routed by the envelope's group id
struct RaftVerbHandler {
    verb: Verb,
    servers: Arc<ServerMap>,
}

impl RaftVerbHandler {
    fn server(&self, gid: GroupId) -> anyhow::Result<Arc<OpenRaftServer>> {
        self.servers
            .get(&gid)
            .map(|server| server.value().clone())
            .ok_or_else(|| anyhow::Error::new(ZerothError::UnknownGroup(gid.to_string())))
    }
}

#[async_trait::async_trait]
impl MessageHandler for RaftVerbHandler {
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let reply = match self.verb {
            Verb::RaftAppendEntries => {
                let envelope: RaftEnvelope<AppendEntriesRequest<TypeConfig>> = serde_json::from_slice(&body)?;
                let server = self.server(envelope.group_id)?;
                let reply: RaftReply<_> = server.raft.append_entries(envelope.payload).await;
                serde_json::to_vec(&reply)?
            }
            Verb::RaftVote => {
                let envelope: RaftEnvelope<VoteRequest<ServerId>> = serde_json::from_slice(&body)?;
                let server = self.server(envelope.group_id)?;
                let reply: RaftReply<_> = server.raft.vote(envelope.payload).await;
                serde_json::to_vec(&reply)?
            }
            Verb::RaftInstallSnapshot => {
                let envelope: RaftEnvelope<InstallSnapshotRequest<TypeConfig>> = serde_json::from_slice(&body)?;
                let server = self.server(envelope.group_id)?;
                let reply: RaftReply<_, _> = server.raft.install_snapshot(envelope.payload).await;
                serde_json::to_vec(&reply)?
            }
            Verb::RaftModifyConfig => {
                let envelope: RaftEnvelope<ModifyConfigForward> = serde_json::from_slice(&body)?;
                let server = self.server(envelope.group_id)?;
                let reply: std::result::Result<(), String> = server
                    .modify_config(envelope.payload.add, envelope.payload.del)
                    .await
                    .map_err(|e| e.to_string());
                serde_json::to_vec(&reply)?
            }
            other => anyhow::bail!("verb {} is not a raft verb", other),
        };
        Ok(reply)
    }
}

const RAFT_VERBS: [Verb; 4] = [
    Verb::RaftAppendEntries,
    Verb::RaftVote,
    Verb::RaftInstallSnapshot,
    Verb::RaftModifyConfig,
];

/// Builds openraft-backed server bundles and serves the raft verbs for them
pub struct OpenRaftFactory {
    config: RaftConfig,
    messaging: Arc<dyn MessagingService>,
    address_map: Arc<RaftAddressMap>,
    servers: Arc<ServerMap>,
}

impl OpenRaftFactory {
    pub fn new(
        config: RaftConfig,
        messaging: Arc<dyn MessagingService>,
        address_map: Arc<RaftAddressMap>,
    ) -> Self {
        let servers: Arc<ServerMap> = Arc::new(DashMap::new());
        for verb in RAFT_VERBS {
            messaging.handlers().register(
                verb,
                Arc::new(RaftVerbHandler {
                    verb,
                    servers: servers.clone(),
                }),
            );
        }
        Self {
            config,
            messaging,
            address_map,
            servers,
        }
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn server(&self, gid: GroupId) -> Option<Arc<OpenRaftServer>> {
        self.servers.get(&gid).map(|server| server.value().clone())
    }

    /// Stop serving the raft verbs and forget every server
    pub fn shutdown(&self) {
        for verb in RAFT_VERBS {
            self.messaging.handlers().unregister(verb);
        }
        self.servers.clear();
    }
}

#[async_trait::async_trait]
impl RaftServerFactory for OpenRaftFactory {
    async fn create_server(
        &self,
        gid: GroupId,
        my_addr: ServerAddress,
        on_change: MembershipChangeHook,
    ) -> Result<RaftServerForGroup> {
        if self.servers.contains_key(&gid) {
            warn!("Replacing raft server of group {}", gid);
        }
        info!(
            "Creating raft server {} for group {} in {}",
            my_addr.id,
            gid,
            self.config.group_dir(gid).display()
        );
        self.config
            .ensure_dirs(gid)
            .map_err(|e| ZerothError::Storage(e.to_string()))?;

        let log_store = RocksLogStore::new(self.config.log_dir(gid))
            .await
            .map_err(|e| ZerothError::Storage(e.to_string()))?;
        let persistence = log_store.persistence();
        let state_machine = Group0StateMachine::new(self.config.state_machine_dir(gid))
            .await
            .map_err(|e| ZerothError::Storage(e.to_string()))?;
        let metadata = state_machine.reader();

        let rpc = Arc::new(RaftRpc::new(
            gid,
            my_addr.id,
            self.messaging.clone(),
            self.address_map.clone(),
            on_change,
        ));
        let network = OpenRaftNetworkFactory::new(rpc.clone(), self.config.rpc_timeout());
        let raft_config = Arc::new(
            self.config
                .to_openraft_config()
                .validate()
                .map_err(|e| ZerothError::Configuration(e.to_string()))?,
        );

        let raft = Raft::new(my_addr.id, raft_config, network, log_store, state_machine)
            .await
            .map_err(raft_error)?;

        let server = Arc::new(OpenRaftServer {
            id: my_addr.id,
            gid,
            raft,
            rpc: rpc.clone(),
            persistence: persistence.clone(),
            metadata,
            rpc_timeout: self.config.rpc_timeout(),
        });
        self.servers.insert(gid, server.clone());

        Ok(RaftServerForGroup {
            gid,
            server,
            rpc,
            persistence: Arc::new(persistence),
            ticker: RaftTicker::new(self.config.tick_interval()),
        })
    }
}
