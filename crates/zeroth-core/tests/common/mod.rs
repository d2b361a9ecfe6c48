// Shared fixtures for group 0 scenarios
// Nodes talk over a LocalNetwork and replicate one configuration per group
// through a shared in-memory cluster

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use zeroth_api::{ConfigMember, LocalMessagingService, LocalNetwork, MessagingService};
use zeroth_common::{
    GroupId, PrimaryContext, Result, ServerAddress, ServerId, ServerInfo, ZerothError,
};
use zeroth_consistency::{
    DirectFailureDetector, FailureDetectorConfig, MembershipChangeHook, RaftAddressMap,
    RaftConfiguration, RaftGroupRegistry, RaftPersistence, RaftRpc, RaftServer, RaftServerFactory,
    RaftServerForGroup, RaftTicker, SystemKeyspace,
};
use zeroth_core::{Gossiper, RaftGroup0, StaticGossiper};

/// Committed configuration of every group, as all members see it
#[derive(Default)]
pub struct FakeCluster {
    groups: Mutex<BTreeMap<GroupId, RaftConfiguration>>,
    commit_delay: Mutex<Duration>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn configuration(&self, gid: GroupId) -> RaftConfiguration {
        self.groups.lock().get(&gid).cloned().unwrap_or_default()
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Make every configuration change take `delay` to commit
    pub fn set_commit_delay(&self, delay: Duration) {
        *self.commit_delay.lock() = delay;
    }
}

pub struct FakePersistence {
    initial: Mutex<Option<RaftConfiguration>>,
}

#[async_trait::async_trait]
impl RaftPersistence for FakePersistence {
    async fn bootstrap(&self, initial: RaftConfiguration) -> Result<()> {
        *self.initial.lock() = Some(initial);
        Ok(())
    }
}

pub struct FakeRaftServer {
    id: ServerId,
    gid: GroupId,
    cluster: Arc<FakeCluster>,
    persistence: Arc<FakePersistence>,
    pub started: AtomicBool,
    pub aborted: AtomicBool,
    pub ticks: AtomicUsize,
}

#[async_trait::async_trait]
impl RaftServer for FakeRaftServer {
    fn id(&self) -> ServerId {
        self.id
    }

    async fn start(&self) -> Result<()> {
        let initial = self.persistence.initial.lock().clone();
        if let Some(initial) = initial
            && !initial.is_empty()
        {
            self.cluster.groups.lock().entry(self.gid).or_insert(initial);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    fn get_configuration(&self) -> RaftConfiguration {
        self.cluster.configuration(self.gid)
    }

    async fn modify_config(&self, add: Vec<ConfigMember>, del: Vec<ServerId>) -> Result<()> {
        let delay = *self.cluster.commit_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut groups = self.cluster.groups.lock();
        let config = groups
            .get_mut(&self.gid)
            .ok_or_else(|| ZerothError::Raft(format!("group {} has no leader", self.gid)))?;
        for member in add {
            config.current.insert(member.addr.id, member);
        }
        for id in del {
            config.current.remove(&id);
        }
        Ok(())
    }
}

pub struct FakeRaftFactory {
    cluster: Arc<FakeCluster>,
    messaging: Arc<dyn MessagingService>,
    address_map: Arc<RaftAddressMap>,
    pub servers: Mutex<Vec<Arc<FakeRaftServer>>>,
}

impl FakeRaftFactory {
    pub fn created(&self) -> usize {
        self.servers.lock().len()
    }
}

#[async_trait::async_trait]
impl RaftServerFactory for FakeRaftFactory {
    async fn create_server(
        &self,
        gid: GroupId,
        my_addr: ServerAddress,
        on_change: MembershipChangeHook,
    ) -> Result<RaftServerForGroup> {
        let persistence = Arc::new(FakePersistence {
            initial: Mutex::new(None),
        });
        let server = Arc::new(FakeRaftServer {
            id: my_addr.id,
            gid,
            cluster: self.cluster.clone(),
            persistence: persistence.clone(),
            started: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            ticks: AtomicUsize::new(0),
        });
        self.servers.lock().push(server.clone());

        let rpc = Arc::new(RaftRpc::new(
            gid,
            my_addr.id,
            self.messaging.clone(),
            self.address_map.clone(),
            on_change,
        ));
        Ok(RaftServerForGroup {
            gid,
            server,
            rpc,
            persistence,
            ticker: RaftTicker::new(Duration::from_millis(10)),
        })
    }
}

pub struct TestNode {
    pub info: ServerInfo,
    pub messaging: Arc<LocalMessagingService>,
    pub keyspace: SystemKeyspace,
    pub registry: Arc<RaftGroupRegistry>,
    pub factory: Arc<FakeRaftFactory>,
    pub gossiper: Arc<StaticGossiper>,
    pub group0: Arc<RaftGroup0>,
    pub abort: CancellationToken,
}

impl TestNode {
    pub fn new(
        network: &Arc<LocalNetwork>,
        cluster: &Arc<FakeCluster>,
        info: &str,
        seeds: &[&str],
    ) -> Self {
        Self::with_keyspace(network, cluster, info, seeds, SystemKeyspace::in_memory(), true)
    }

    pub fn with_keyspace(
        network: &Arc<LocalNetwork>,
        cluster: &Arc<FakeCluster>,
        info: &str,
        seeds: &[&str],
        keyspace: SystemKeyspace,
        raft_enabled: bool,
    ) -> Self {
        let messaging = network.join(info);
        let registry = Arc::new(RaftGroupRegistry::new(
            raft_enabled,
            Arc::new(RaftAddressMap::new()),
            Arc::new(DirectFailureDetector::new(FailureDetectorConfig::default())),
        ));
        let factory = Arc::new(FakeRaftFactory {
            cluster: cluster.clone(),
            messaging: messaging.clone(),
            address_map: registry.address_map().clone(),
            servers: Mutex::new(Vec::new()),
        });
        let gossiper = Arc::new(StaticGossiper::new(
            seeds.iter().map(|seed| ServerInfo::from(*seed)).collect(),
            ServerInfo::from(info),
            messaging.clone(),
        ));
        let abort = CancellationToken::new();
        let group0 = RaftGroup0::new(
            PrimaryContext::current().unwrap(),
            abort.clone(),
            registry.clone(),
            messaging.clone(),
            gossiper.clone(),
            keyspace.clone(),
            factory.clone(),
        );

        Self {
            info: ServerInfo::from(info),
            messaging,
            keyspace,
            registry,
            factory,
            gossiper,
            group0,
            abort,
        }
    }

    pub async fn my_addr(&self) -> ServerAddress {
        let id = self.keyspace.get_raft_server_id().await.unwrap().unwrap();
        ServerAddress::new(id, self.gossiper.broadcast_address())
    }

    pub async fn shutdown(&self) {
        self.abort.cancel();
        self.group0.abort().await;
        self.registry.abort().await;
    }
}
