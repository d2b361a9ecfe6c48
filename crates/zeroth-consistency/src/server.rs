//! Consensus engine boundary
//!
//! The group 0 orchestrator talks to the consensus engine only through the
//! traits in this module. A server bundle ([`RaftServerForGroup`]) carries
//! everything that runs for one group: the engine instance, its RPC adapter,
//! its durable log (used to bootstrap the initial configuration) and the
//! ticker that drives the engine clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroth_api::ConfigMember;
use zeroth_common::{GroupId, Result, ServerAddress, ServerId};

use crate::rpc::RaftRpc;

/// Members of a consensus configuration, keyed by server id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftConfiguration {
    pub current: BTreeMap<ServerId, ConfigMember>,
}

impl RaftConfiguration {
    pub fn new(members: impl IntoIterator<Item = ConfigMember>) -> Self {
        Self {
            current: members
                .into_iter()
                .map(|member| (member.addr.id, member))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.current.contains_key(&id)
    }

    pub fn can_vote(&self, id: ServerId) -> bool {
        self.current.get(&id).is_some_and(|member| member.can_vote)
    }

    pub fn voters(&self) -> impl Iterator<Item = &ConfigMember> {
        self.current.values().filter(|member| member.can_vote)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.current.values().map(|member| &member.addr)
    }
}

/// A running consensus server for one group
#[async_trait::async_trait]
pub trait RaftServer: Send + Sync {
    fn id(&self) -> ServerId;

    async fn start(&self) -> Result<()>;

    async fn abort(&self) -> Result<()>;

    /// Advance the engine clock by one tick
    fn tick(&self);

    fn get_configuration(&self) -> RaftConfiguration;

    /// Add (or change the voting role of) `add`, remove `del`
    async fn modify_config(&self, add: Vec<ConfigMember>, del: Vec<ServerId>) -> Result<()>;
}

/// Durable log of a consensus server
#[async_trait::async_trait]
pub trait RaftPersistence: Send + Sync {
    /// Record the configuration the server starts from. An empty configuration
    /// creates a non-voting shell that waits to be added by the leader.
    async fn bootstrap(&self, initial: RaftConfiguration) -> Result<()>;
}

/// Called with a peer address and `true` when it enters the RPC map, `false`
/// when it leaves.
pub type MembershipChangeHook = Arc<dyn Fn(&ServerAddress, bool) + Send + Sync>;

/// Builds server bundles for a consensus engine
#[async_trait::async_trait]
pub trait RaftServerFactory: Send + Sync {
    async fn create_server(
        &self,
        gid: GroupId,
        my_addr: ServerAddress,
        on_change: MembershipChangeHook,
    ) -> Result<RaftServerForGroup>;
}

/// Periodic driver of a server's clock. Each tick also pushes the current
/// configuration to the RPC adapter so the address map and failure detector
/// follow membership changes.
pub struct RaftTicker {
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RaftTicker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_armed(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn arm(&self, server: Arc<dyn RaftServer>, rpc: Arc<RaftRpc>, stop: CancellationToken) {
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = timer.tick() => {
                        server.tick();
                        rpc.on_configuration_change(&server.get_configuration());
                    }
                }
            }
            debug!("Ticker for server {} stopped", server.id());
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for RaftTicker {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Everything that runs for one consensus group
pub struct RaftServerForGroup {
    pub gid: GroupId,
    pub server: Arc<dyn RaftServer>,
    pub rpc: Arc<RaftRpc>,
    pub persistence: Arc<dyn RaftPersistence>,
    pub ticker: RaftTicker,
}
