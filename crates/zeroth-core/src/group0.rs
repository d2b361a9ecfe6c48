//! Group 0 membership orchestrator
//!
//! [`RaftGroup0`] takes a node from "no cluster" to "member of group 0": it
//! discovers or founds the group, builds and starts the local consensus
//! server, asks the group to add this node, and later promotes, removes or
//! retires members. It also answers the two group 0 verbs for other nodes.
//!
//! Every operation runs on the primary execution context. Inbound verbs are
//! submitted there before they look at the bootstrap phase.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};
use zeroth_api::{
    ConfigMember, Group0Info, Group0RpcHandler, MessagingService, ModifyConfigRequest,
    PeerExchangeReply, PeerList, register_group0_verbs, send_group0_modify_config,
    unregister_group0_verbs,
};
use zeroth_common::{
    Gate, GroupId, Peer, PrimaryContext, Result, ServerAddress, ServerId, ServerInfo, ZerothError,
    abortable, sleep_abortable,
};
use zeroth_consistency::{
    MembershipChangeHook, RaftConfiguration, RaftGroupRegistry, RaftServer, RaftServerFactory,
    RaftServerForGroup, SystemKeyspace,
};

use crate::gossip::Gossiper;
use crate::persistent_discovery::PersistentDiscovery;

/// Deadline of the "add me" request sent while joining
pub const JOIN_MODIFY_CONFIG_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause before retrying a failed join request
pub const JOIN_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Deadline of a remote node removal. The caller retries or aborts removals
/// itself, so a slow network must not fail them.
pub const REMOVE_NODE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Where this node is in the group 0 bootstrap
#[derive(Clone, Default)]
pub enum Group0Phase {
    /// Discovery has not started, or finished and its result is being applied
    #[default]
    NotStarted,
    Discovering(Arc<PersistentDiscovery>),
    Joined(GroupId),
}

/// Restores [`Group0Phase::NotStarted`] when discovery ends, including when
/// the discovering future is dropped.
struct ResetPhase<'a>(&'a Mutex<Group0Phase>);

impl Drop for ResetPhase<'_> {
    fn drop(&mut self) {
        *self.0.lock() = Group0Phase::NotStarted;
    }
}

pub struct RaftGroup0 {
    primary: PrimaryContext,
    abort: CancellationToken,
    raft_gr: Arc<RaftGroupRegistry>,
    messaging: Arc<dyn MessagingService>,
    gossiper: Arc<dyn Gossiper>,
    keyspace: SystemKeyspace,
    factory: Arc<dyn RaftServerFactory>,
    shutdown_gate: Gate,
    phase: Mutex<Group0Phase>,
}

impl RaftGroup0 {
    /// Build the orchestrator and start serving the group 0 verbs
    pub fn new(
        primary: PrimaryContext,
        abort: CancellationToken,
        raft_gr: Arc<RaftGroupRegistry>,
        messaging: Arc<dyn MessagingService>,
        gossiper: Arc<dyn Gossiper>,
        keyspace: SystemKeyspace,
        factory: Arc<dyn RaftServerFactory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            register_group0_verbs(
                messaging.as_ref(),
                Arc::new(Group0VerbHandler {
                    group0: weak.clone(),
                }),
            );
            Self {
                primary,
                abort,
                raft_gr,
                messaging,
                gossiper,
                keyspace,
                factory,
                shutdown_gate: Gate::new(),
                phase: Mutex::new(Group0Phase::NotStarted),
            }
        })
    }

    pub fn joined_group0(&self) -> bool {
        matches!(*self.phase.lock(), Group0Phase::Joined(_))
    }

    /// Id of group 0 once joined
    pub fn group0_id(&self) -> Option<GroupId> {
        match *self.phase.lock() {
            Group0Phase::Joined(gid) => Some(gid),
            _ => None,
        }
    }

    pub fn registry(&self) -> &Arc<RaftGroupRegistry> {
        &self.raft_gr
    }

    /// This node's consensus address. The server id must already exist.
    pub async fn load_my_addr(&self) -> Result<ServerAddress> {
        self.primary.assert_current("load_my_addr");

        match self.keyspace.get_raft_server_id().await? {
            Some(id) => Ok(ServerAddress::new(id, self.gossiper.broadcast_address())),
            None => {
                error!("load_my_addr(): server ID for group 0 missing");
                Err(ZerothError::Internal(
                    "load_my_addr(): server ID for group 0 missing".to_string(),
                ))
            }
        }
    }

    /// This node's consensus address, creating and persisting a random server
    /// id on first use.
    pub async fn load_or_create_my_addr(&self) -> Result<ServerAddress> {
        self.primary.assert_current("load_or_create_my_addr");

        let id = match self.keyspace.get_raft_server_id().await? {
            Some(id) => id,
            None => {
                let id = ServerId::new_random();
                self.keyspace.set_raft_server_id(id).await?;
                info!("Created raft server id {}", id);
                id
            }
        };
        Ok(ServerAddress::new(id, self.gossiper.broadcast_address()))
    }

    /// Build the server bundle for group 0. Peers entering or leaving the
    /// group's RPC map are tracked by the direct failure detector.
    pub async fn create_server_for_group0(
        &self,
        gid: GroupId,
        my_addr: ServerAddress,
    ) -> Result<RaftServerForGroup> {
        self.primary.assert_current("create_server_for_group0");

        self.raft_gr.address_map().set(&my_addr);

        let pinger = self.gossiper.direct_fd_pinger();
        let direct_fd = self.raft_gr.direct_fd().clone();
        let on_change: MembershipChangeHook = Arc::new(move |addr: &ServerAddress, added: bool| {
            let endpoint = pinger.allocate_id(&addr.info);
            if added {
                info!("Added {} (address: {}) to group 0 RPC map", addr.id, addr.info);
                direct_fd.add_endpoint(endpoint);
            } else {
                info!("Removed {} (address: {}) from group 0 RPC map", addr.id, addr.info);
                direct_fd.remove_endpoint(endpoint);
            }
        });

        self.factory.create_server(gid, my_addr, on_change).await
    }

    /// Find group 0 through the seeds, or found it. While this runs the node
    /// answers peer exchanges from its discovery state.
    pub async fn discover_group0(&self, my_addr: &ServerAddress) -> Result<Group0Info> {
        self.primary.assert_current("discover_group0");

        let seeds: PeerList = self
            .gossiper
            .seeds()
            .into_iter()
            .map(Peer::unknown)
            .collect();
        let discovery = Arc::new(
            PersistentDiscovery::make(my_addr.clone(), seeds, self.keyspace.clone()).await?,
        );

        *self.phase.lock() = Group0Phase::Discovering(discovery.clone());
        let _reset = ResetPhase(&self.phase);

        let result = match self.shutdown_gate.hold() {
            Ok(holder) => {
                discovery
                    .run(self.messaging.as_ref(), holder, &self.abort, my_addr.clone())
                    .await
            }
            Err(e) => Err(e),
        };
        discovery.stop().await;
        result
    }

    /// Start the server of a group 0 this node has joined before
    pub async fn start_server_for_group0(&self, gid: GroupId) -> Result<()> {
        self.primary.assert_current("start_server_for_group0");

        let my_addr = self.load_my_addr().await?;
        info!("Server {} is starting group 0 with id {}", my_addr.id, gid);

        let bundle = self.create_server_for_group0(gid, my_addr).await?;
        self.raft_gr.start_server_for_group(bundle).await?;
        self.raft_gr.set_group0_id(gid);
        *self.phase.lock() = Group0Phase::Joined(gid);
        Ok(())
    }

    /// Join group 0, founding it if discovery elects this node.
    ///
    /// A group id persisted by an earlier run short-circuits discovery. The
    /// group id is persisted only after this node is in the configuration or
    /// the leader accepted the request to add it.
    pub async fn join_group0(&self) -> Result<()> {
        self.primary.assert_current("join_group0");
        if self.joined_group0() {
            return Err(ZerothError::Internal(
                "join_group0(): already joined group 0".to_string(),
            ));
        }

        if let Some(gid) = self.keyspace.get_raft_group0_id().await? {
            return self.start_server_for_group0(gid).await;
        }

        let my_addr = self.load_or_create_my_addr().await?;
        trace!("{} found no local group 0. Discovering...", my_addr.id);

        let mut started: Option<(GroupId, Arc<dyn RaftServer>)> = None;
        let joined: Result<GroupId> = async {
            let gid = self.join_as_member(&my_addr, &mut started).await?;
            // Peer exchanges may hand out group 0 only once its id is durable.
            self.keyspace.set_raft_group0_id(gid).await?;
            Ok(gid)
        }
        .await;

        let gid = match joined {
            Ok(gid) => gid,
            Err(e) => {
                // A failed join leaves no group 0 server running
                if let Some((gid, _)) = started {
                    warn!("{} failed to join group 0 {}: {}", my_addr.id, gid, e);
                    self.raft_gr.stop_server_for_group(gid).await;
                }
                return Err(e);
            }
        };
        self.raft_gr.set_group0_id(gid);
        *self.phase.lock() = Group0Phase::Joined(gid);
        info!("{} joined group 0 with id {}", my_addr.id, gid);
        Ok(())
    }

    /// Start the group 0 server on first contact and retry the "add me"
    /// request until this node is in the configuration. `started` records the
    /// server once it runs.
    async fn join_as_member(
        &self,
        my_addr: &ServerAddress,
        started: &mut Option<(GroupId, Arc<dyn RaftServer>)>,
    ) -> Result<GroupId> {
        loop {
            let info = self.discover_group0(my_addr).await?;
            trace!(
                "server {} found group 0 with id {}, leader {}",
                my_addr.id, info.group0_id, info.addr.id
            );

            let (gid, server) = match &*started {
                Some((gid, _)) if *gid != info.group0_id => {
                    return Err(ZerothError::Configuration(format!(
                        "Can't add server to two clusters ({} and {}). Please check your seeds don't overlap",
                        gid, info.group0_id
                    )));
                }
                Some((gid, server)) => (*gid, server.clone()),
                None => {
                    let initial = if info.addr.id == my_addr.id {
                        trace!("server {} creating configuration as voter", my_addr.id);
                        RaftConfiguration::new([ConfigMember::voter(my_addr.clone())])
                    } else {
                        RaftConfiguration::default()
                    };

                    let bundle = self
                        .create_server_for_group0(info.group0_id, my_addr.clone())
                        .await?;
                    let server = bundle.server.clone();
                    bundle.persistence.bootstrap(initial).await?;
                    self.raft_gr.start_server_for_group(bundle).await?;
                    *started = Some((info.group0_id, server.clone()));
                    (info.group0_id, server)
                }
            };

            let config = server.get_configuration();
            if config.contains(my_addr.id) {
                // A new group, or a change requested by an earlier attempt
                trace!(
                    "server {} already in group as {}",
                    my_addr.id,
                    if config.can_vote(my_addr.id) { "voter" } else { "non-voter" }
                );
                return Ok(gid);
            }

            let _pause_shutdown = self.shutdown_gate.hold()?;
            let request = ModifyConfigRequest {
                group0_id: gid,
                add: vec![ConfigMember::non_voter(my_addr.clone())],
                del: vec![],
            };
            match send_group0_modify_config(
                self.messaging.as_ref(),
                &info.addr.info,
                &request,
                JOIN_MODIFY_CONFIG_TIMEOUT,
            )
            .await
            {
                Ok(()) => return Ok(gid),
                Err(e) if e.is_transport() => {
                    error!("failed to modify config at peer {}: {}", info.addr.id, e);
                }
                Err(e) => return Err(e.into()),
            }

            sleep_abortable(JOIN_RETRY_PAUSE, &self.abort).await?;
        }
    }

    /// Bring group 0 up at node start
    pub async fn setup_group0(&self) -> Result<()> {
        self.primary.assert_current("setup_group0");

        if !self.raft_gr.is_enabled() {
            info!("setup_group0(): local RAFT feature disabled, skipping group 0 setup.");
            return Ok(());
        }

        if self.keyspace.bootstrap_complete().await? {
            match self.keyspace.get_raft_group0_id().await? {
                Some(gid) => {
                    info!("setup_group0(): group 0 ID present. Starting existing Raft server.");
                    self.start_server_for_group0(gid).await?;
                }
                None => {
                    // TODO: migrate nodes provisioned before group 0 existed
                    info!("setup_group0(): node bootstrapped without group 0, skipping group 0 setup.");
                }
            }
            return Ok(());
        }

        info!("setup_group0(): joining group 0...");
        self.join_group0().await?;
        info!("setup_group0(): successfully joined group 0.");
        Ok(())
    }

    /// Promote this node to a voter if it joined as a non-voter
    pub async fn become_voter(&self) -> Result<()> {
        self.primary.assert_current("become_voter");

        let Some(gid) = self.group0_id() else {
            return Ok(());
        };
        if !self.raft_gr.is_enabled() {
            return Ok(());
        }

        let my_addr = self.load_my_addr().await?;
        if !self
            .raft_gr
            .get_server(gid)?
            .get_configuration()
            .can_vote(my_addr.id)
        {
            let _pause_shutdown = self.shutdown_gate.hold()?;
            let group0 = self.raft_gr.group0()?;
            abortable(
                group0.modify_config(vec![ConfigMember::voter(my_addr)], vec![]),
                &self.abort,
            )
            .await?;
        }
        Ok(())
    }

    /// Remove this node from group 0.
    ///
    /// Blocks when this node is the leader until leadership moves elsewhere;
    /// the abort token ends the wait.
    pub async fn leave_group0(&self) -> Result<()> {
        self.primary.assert_current("leave_group0");

        if !self.raft_gr.is_enabled() {
            info!("leave_group0: local RAFT feature disabled, skipping.");
            return Ok(());
        }
        if !self.joined_group0() {
            return Ok(());
        }

        let Some(my_id) = self.keyspace.get_raft_server_id().await? else {
            error!("leave_group0: group 0 ID is present but Raft server ID is not");
            return Err(ZerothError::Internal(
                "leave_group0: group 0 ID is present but Raft server ID is not".to_string(),
            ));
        };

        let group0 = self.raft_gr.group0()?;
        abortable(group0.modify_config(vec![], vec![my_id]), &self.abort).await
    }

    /// Remove the member at `node` from group 0, through the local server when
    /// joined, otherwise through a discovered member.
    pub async fn remove_from_group0(&self, node: &ServerInfo) -> Result<()> {
        if !self.raft_gr.is_enabled() {
            return Ok(());
        }
        self.primary.assert_current("remove_from_group0");

        let Some(my_id) = self.keyspace.get_raft_server_id().await? else {
            return Err(ZerothError::NotClusterMember(
                "Can't invoke removenode on a node which is not part of the cluster".to_string(),
            ));
        };
        let Some(remove_id) = self.raft_gr.address_map().find_replace_id(node, my_id) else {
            // Not part of the configuration
            return Ok(());
        };

        let _pause_shutdown = self.shutdown_gate.hold()?;
        if self.joined_group0() {
            let group0 = self.raft_gr.group0()?;
            return abortable(group0.modify_config(vec![], vec![remove_id]), &self.abort).await;
        }

        let my_addr = ServerAddress::new(my_id, self.gossiper.broadcast_address());
        let info = self.discover_group0(&my_addr).await?;
        if info.addr.id == my_id {
            return Ok(());
        }

        info!("Removing {} (address: {}) through {}", remove_id, node, info.addr);
        let request = ModifyConfigRequest {
            group0_id: info.group0_id,
            add: vec![],
            del: vec![remove_id],
        };
        send_group0_modify_config(
            self.messaging.as_ref(),
            &info.addr.info,
            &request,
            REMOVE_NODE_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Answer a peer exchange according to the bootstrap phase
    pub async fn peer_exchange(&self, peers: PeerList) -> Result<PeerExchangeReply> {
        self.primary.assert_current("peer_exchange");

        let phase = self.phase.lock().clone();
        match phase {
            Group0Phase::NotStarted => Ok(PeerExchangeReply::NoInfo),
            Group0Phase::Discovering(discovery) => Ok(match discovery.request(peers).await? {
                Some(list) => PeerExchangeReply::PeerList(list),
                // Elected itself, group 0 info follows once it is persisted
                None => PeerExchangeReply::NoInfo,
            }),
            Group0Phase::Joined(gid) => {
                // Followers answer with their own address too; the request
                // is forwarded to the leader from there.
                let my_id = self.raft_gr.group0()?.id();
                Ok(PeerExchangeReply::Group0Info(Group0Info {
                    group0_id: gid,
                    addr: self.raft_gr.address_map().get_server_address(my_id)?,
                }))
            }
        }
    }

    /// Stop serving the group 0 verbs and wait for pending operations,
    /// including verbs already being answered
    pub async fn abort(&self) {
        self.primary.assert_current("abort");

        unregister_group0_verbs(self.messaging.as_ref());
        self.shutdown_gate.close().await;
        info!("Group 0 stopped");
    }
}

/// Serves the group 0 verbs for a [`RaftGroup0`] without keeping it alive
struct Group0VerbHandler {
    group0: Weak<RaftGroup0>,
}

impl Group0VerbHandler {
    fn group0(&self) -> Result<Arc<RaftGroup0>> {
        self.group0
            .upgrade()
            .ok_or_else(|| ZerothError::Internal("group 0 service is gone".to_string()))
    }
}

#[async_trait::async_trait]
impl Group0RpcHandler for Group0VerbHandler {
    async fn peer_exchange(&self, peers: PeerList) -> anyhow::Result<PeerExchangeReply> {
        let group0 = self.group0()?;
        let holder = group0.shutdown_gate.hold()?;
        let primary = group0.primary.clone();
        Ok(primary
            .submit(async move {
                let _holder = holder;
                group0.peer_exchange(peers).await
            })
            .await?)
    }

    async fn modify_config(&self, request: ModifyConfigRequest) -> anyhow::Result<()> {
        let group0 = self.group0()?;
        let _holder = group0.shutdown_gate.hold()?;
        let server = group0.raft_gr.get_server(request.group0_id)?;
        server.modify_config(request.add, request.del).await?;
        Ok(())
    }
}
