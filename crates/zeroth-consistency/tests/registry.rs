// Raft group registry driving a scripted server

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use zeroth_api::{ConfigMember, LocalNetwork};
use zeroth_common::{GroupId, Result, ServerAddress, ServerId, ServerInfo, ZerothError};
use zeroth_consistency::{
    DirectFailureDetector, FailureDetectorConfig, MembershipChangeHook, RaftAddressMap,
    RaftConfiguration, RaftGroupRegistry, RaftPersistence, RaftRpc, RaftServer,
    RaftServerForGroup, RaftTicker,
};

#[derive(Default)]
struct ScriptedServer {
    id: ServerId,
    config: Mutex<RaftConfiguration>,
    ticks: AtomicUsize,
    started: AtomicBool,
    aborted: AtomicBool,
}

#[async_trait::async_trait]
impl RaftServer for ScriptedServer {
    fn id(&self) -> ServerId {
        self.id
    }

    async fn start(&self) -> Result<()> {
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
        self.config.lock().clone()
    }

    async fn modify_config(&self, _add: Vec<ConfigMember>, _del: Vec<ServerId>) -> Result<()> {
        Err(ZerothError::Raft("not supported".to_string()))
    }
}

struct NoopPersistence;

#[async_trait::async_trait]
impl RaftPersistence for NoopPersistence {
    async fn bootstrap(&self, _initial: RaftConfiguration) -> Result<()> {
        Ok(())
    }
}

fn registry() -> RaftGroupRegistry {
    RaftGroupRegistry::new(
        true,
        Arc::new(RaftAddressMap::new()),
        Arc::new(DirectFailureDetector::new(FailureDetectorConfig::default())),
    )
}

fn bundle(
    registry: &RaftGroupRegistry,
    network: &Arc<LocalNetwork>,
    gid: GroupId,
    server: Arc<ScriptedServer>,
    hook: MembershipChangeHook,
) -> RaftServerForGroup {
    let rpc = Arc::new(RaftRpc::new(
        gid,
        server.id,
        network.join("a:1"),
        registry.address_map().clone(),
        hook,
    ));
    RaftServerForGroup {
        gid,
        server,
        rpc,
        persistence: Arc::new(NoopPersistence),
        ticker: RaftTicker::new(Duration::from_millis(10)),
    }
}

#[tokio::test(start_paused = true)]
async fn test_started_server_is_ticked_and_tracks_membership() {
    let network = LocalNetwork::new();
    let registry = registry();
    let gid = GroupId::new_time_ordered();
    let server = Arc::new(ScriptedServer {
        id: ServerId::new_random(),
        ..Default::default()
    });
    let added: Arc<Mutex<Vec<ServerAddress>>> = Arc::default();
    let hook: MembershipChangeHook = {
        let added = added.clone();
        Arc::new(move |addr: &ServerAddress, is_added: bool| {
            if is_added {
                added.lock().push(addr.clone());
            }
        })
    };

    registry
        .start_server_for_group(bundle(&registry, &network, gid, server.clone(), hook))
        .await
        .unwrap();
    registry.set_group0_id(gid);
    assert!(server.started.load(Ordering::SeqCst));
    assert_eq!(registry.group0().unwrap().id(), server.id);

    let peer = ServerAddress::new(ServerId::new_random(), ServerInfo::from("b:1"));
    *server.config.lock() = RaftConfiguration::new([ConfigMember::voter(peer.clone())]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.ticks.load(Ordering::SeqCst) >= 2);
    assert_eq!(added.lock().clone(), vec![peer.clone()]);
    assert_eq!(registry.address_map().find(peer.id), Some(peer.info));

    registry.abort().await;
    assert!(server.aborted.load(Ordering::SeqCst));
    assert_eq!(registry.group_count(), 0);

    // Ticking stops with the registry
    let ticks = server.ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.ticks.load(Ordering::SeqCst), ticks);
}

#[tokio::test]
async fn test_duplicate_group_is_rejected() {
    let network = LocalNetwork::new();
    let registry = registry();
    let gid = GroupId::new_time_ordered();
    let hook: MembershipChangeHook = Arc::new(|_: &ServerAddress, _: bool| {});

    let first = Arc::new(ScriptedServer::default());
    registry
        .start_server_for_group(bundle(&registry, &network, gid, first, hook.clone()))
        .await
        .unwrap();

    let second = Arc::new(ScriptedServer::default());
    assert!(
        registry
            .start_server_for_group(bundle(&registry, &network, gid, second, hook))
            .await
            .is_err()
    );
    assert!(matches!(
        registry.get_server(GroupId::new_time_ordered()),
        Err(ZerothError::UnknownGroup(_))
    ));

    registry.abort().await;
}

#[tokio::test(start_paused = true)]
async fn test_stopped_group_releases_server_and_peers() {
    let network = LocalNetwork::new();
    let registry = registry();
    let gid = GroupId::new_time_ordered();
    let server = Arc::new(ScriptedServer {
        id: ServerId::new_random(),
        ..Default::default()
    });
    let events: Arc<Mutex<Vec<(ServerId, bool)>>> = Arc::default();
    let hook: MembershipChangeHook = {
        let events = events.clone();
        Arc::new(move |addr: &ServerAddress, added: bool| events.lock().push((addr.id, added)))
    };

    let peer = ServerAddress::new(ServerId::new_random(), ServerInfo::from("b:1"));
    *server.config.lock() = RaftConfiguration::new([ConfigMember::voter(peer.clone())]);
    registry
        .start_server_for_group(bundle(&registry, &network, gid, server.clone(), hook.clone()))
        .await
        .unwrap();
    registry.set_group0_id(gid);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.address_map().find(peer.id), Some(peer.info.clone()));

    registry.stop_server_for_group(gid).await;
    assert!(server.aborted.load(Ordering::SeqCst));
    assert_eq!(registry.group_count(), 0);
    assert_eq!(registry.group0_id(), None);
    assert_eq!(registry.address_map().find(peer.id), None);
    assert_eq!(events.lock().clone(), vec![(peer.id, true), (peer.id, false)]);

    let ticks = server.ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.ticks.load(Ordering::SeqCst), ticks);

    // The group can be started again, and stopping an unknown group is a no-op
    let again = Arc::new(ScriptedServer::default());
    registry
        .start_server_for_group(bundle(&registry, &network, gid, again, hook))
        .await
        .unwrap();
    registry.stop_server_for_group(GroupId::new_time_ordered()).await;
    assert_eq!(registry.group_count(), 1);

    registry.abort().await;
}
