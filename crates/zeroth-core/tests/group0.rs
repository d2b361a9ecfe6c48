// Group 0 bootstrap and membership scenarios over an in-process network

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{FakeCluster, TestNode};
use parking_lot::Mutex;
use zeroth_api::{
    ConfigMember, Group0Info, Group0RpcHandler, LocalMessagingService, LocalNetwork,
    ModifyConfigRequest, PeerExchangeReply, PeerList, Verb, register_group0_verbs,
    send_group0_modify_config, send_group0_peer_exchange,
};
use zeroth_common::{GroupId, Peer, ServerAddress, ServerId, ServerInfo, ZerothError};
use zeroth_consistency::{RaftServer, SystemKeyspace};
use zeroth_core::Gossiper;

/// A group 0 member answering the verbs from a script. Peer exchanges hand
/// out `fixed` when set, otherwise a fresh group id each time.
struct ScriptedMember {
    addr: ServerAddress,
    fixed: Mutex<Option<GroupId>>,
    handed_out: Mutex<Vec<GroupId>>,
    failures_left: AtomicUsize,
    requests: Mutex<Vec<ModifyConfigRequest>>,
}

impl ScriptedMember {
    /// Serve the verbs at `info`; the first `failures` config changes fail
    fn serve(
        network: &Arc<LocalNetwork>,
        info: &str,
        fixed: Option<GroupId>,
        failures: usize,
    ) -> (Arc<LocalMessagingService>, Arc<Self>) {
        let messaging = network.join(info);
        let member = Arc::new(Self {
            addr: ServerAddress::new(ServerId::new_random(), ServerInfo::from(info)),
            fixed: Mutex::new(fixed),
            handed_out: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(failures),
            requests: Mutex::new(Vec::new()),
        });
        register_group0_verbs(messaging.as_ref(), member.clone());
        (messaging, member)
    }
}

#[async_trait::async_trait]
impl Group0RpcHandler for ScriptedMember {
    async fn peer_exchange(&self, _peers: PeerList) -> anyhow::Result<PeerExchangeReply> {
        let fixed = *self.fixed.lock();
        let group0_id = fixed.unwrap_or_else(GroupId::new_time_ordered);
        self.handed_out.lock().push(group0_id);
        Ok(PeerExchangeReply::Group0Info(Group0Info {
            group0_id,
            addr: self.addr.clone(),
        }))
    }

    async fn modify_config(&self, request: ModifyConfigRequest) -> anyhow::Result<()> {
        self.requests.lock().push(request);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("leader is not ready");
        }
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_single_node_founds_group0() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);

    a.group0.setup_group0().await.unwrap();

    assert!(a.group0.joined_group0());
    let gid = a.keyspace.get_raft_group0_id().await.unwrap().unwrap();
    assert_eq!(a.group0.group0_id(), Some(gid));
    assert_eq!(a.registry.group0_id(), Some(gid));

    let me = a.my_addr().await;
    let config = cluster.configuration(gid);
    assert_eq!(config.current.len(), 1);
    assert!(config.can_vote(me.id));

    // Only seed is itself: nothing went over the network
    assert_eq!(a.messaging.total_sent(), 0);
    assert_eq!(a.factory.created(), 1);

    a.shutdown().await;
}

#[tokio::test]
async fn test_second_node_joins_as_non_voter_then_becomes_voter() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);
    a.group0.setup_group0().await.unwrap();
    let gid = a.group0.group0_id().unwrap();

    let b = TestNode::new(&network, &cluster, "b:1", &["a:1"]);
    b.group0.setup_group0().await.unwrap();

    assert_eq!(b.group0.group0_id(), Some(gid));
    assert_eq!(b.keyspace.get_raft_group0_id().await.unwrap(), Some(gid));
    assert_eq!(b.messaging.sent(Verb::Group0ModifyConfig), 1);

    let b_addr = b.my_addr().await;
    let config = cluster.configuration(gid);
    assert!(config.contains(b_addr.id));
    assert!(!config.can_vote(b_addr.id));

    b.group0.become_voter().await.unwrap();
    assert!(cluster.configuration(gid).can_vote(b_addr.id));

    // Already a voter: no further change
    b.group0.become_voter().await.unwrap();
    assert_eq!(cluster.configuration(gid).voters().count(), 2);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_persisted_group0_id_skips_discovery() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let keyspace = SystemKeyspace::in_memory();
    let gid = GroupId::new_time_ordered();
    keyspace.set_raft_server_id(ServerId::new_random()).await.unwrap();
    keyspace.set_raft_group0_id(gid).await.unwrap();

    let a = TestNode::with_keyspace(&network, &cluster, "a:1", &["b:1", "c:1"], keyspace, true);
    a.group0.join_group0().await.unwrap();

    assert_eq!(a.group0.group0_id(), Some(gid));
    assert_eq!(a.messaging.total_sent(), 0);
    assert_eq!(a.factory.created(), 1);
    assert!(
        a.factory.servers.lock()[0]
            .started
            .load(std::sync::atomic::Ordering::SeqCst)
    );

    a.shutdown().await;
}

#[tokio::test]
async fn test_setup_after_bootstrap_restarts_existing_server() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let keyspace = SystemKeyspace::in_memory();
    let gid = GroupId::new_time_ordered();
    keyspace.set_raft_server_id(ServerId::new_random()).await.unwrap();
    keyspace.set_raft_group0_id(gid).await.unwrap();
    keyspace.set_bootstrap_complete().await.unwrap();

    let a = TestNode::with_keyspace(&network, &cluster, "a:1", &["b:1"], keyspace, true);
    a.group0.setup_group0().await.unwrap();

    assert_eq!(a.group0.group0_id(), Some(gid));
    assert_eq!(a.messaging.total_sent(), 0);

    a.shutdown().await;
}

#[tokio::test]
async fn test_setup_skips_bootstrapped_node_without_group0() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let keyspace = SystemKeyspace::in_memory();
    keyspace.set_bootstrap_complete().await.unwrap();

    let a = TestNode::with_keyspace(&network, &cluster, "a:1", &["a:1"], keyspace, true);
    a.group0.setup_group0().await.unwrap();

    assert!(!a.group0.joined_group0());
    assert_eq!(a.factory.created(), 0);
    assert_eq!(a.messaging.total_sent(), 0);
}

#[tokio::test]
async fn test_disabled_raft_is_a_no_op() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::with_keyspace(
        &network,
        &cluster,
        "a:1",
        &["a:1"],
        SystemKeyspace::in_memory(),
        false,
    );

    a.group0.setup_group0().await.unwrap();
    a.group0.leave_group0().await.unwrap();
    a.group0
        .remove_from_group0(&ServerInfo::from("b:1"))
        .await
        .unwrap();

    assert!(!a.group0.joined_group0());
    assert_eq!(a.factory.created(), 0);
    assert_eq!(cluster.group_count(), 0);
}

#[tokio::test]
async fn test_three_nodes_agree_on_one_founder() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let seeds = ["a:1", "b:1", "c:1"];
    let a = TestNode::new(&network, &cluster, "a:1", &seeds);
    let b = TestNode::new(&network, &cluster, "b:1", &seeds);
    let c = TestNode::new(&network, &cluster, "c:1", &seeds);

    let (ra, rb, rc) = tokio::join!(
        a.group0.setup_group0(),
        b.group0.setup_group0(),
        c.group0.setup_group0()
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let gid = a.group0.group0_id().unwrap();
    assert_eq!(b.group0.group0_id(), Some(gid));
    assert_eq!(c.group0.group0_id(), Some(gid));
    assert_eq!(cluster.group_count(), 1);

    // The founder is the node with the smallest id
    let addrs = [a.my_addr().await, b.my_addr().await, c.my_addr().await];
    let founder = addrs.iter().min_by_key(|addr| addr.id).unwrap();
    let config = cluster.configuration(gid);
    assert_eq!(config.current.len(), 3);
    let voters: Vec<_> = config.voters().map(|member| member.addr.id).collect();
    assert_eq!(voters, vec![founder.id]);

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_peer_exchange_follows_phase() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);
    let client = network.join("client:1");
    let peers = vec![Peer::unknown(ServerInfo::from("client:1"))];

    let reply = send_group0_peer_exchange(
        client.as_ref(),
        &a.info,
        &peers,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert_eq!(reply, PeerExchangeReply::NoInfo);

    a.group0.setup_group0().await.unwrap();
    let reply = send_group0_peer_exchange(
        client.as_ref(),
        &a.info,
        &peers,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    let PeerExchangeReply::Group0Info(info) = reply else {
        panic!("expected group 0 info");
    };
    assert_eq!(Some(info.group0_id), a.group0.group0_id());
    assert_eq!(info.addr, a.my_addr().await);

    a.shutdown().await;

    // Verbs are gone after abort
    assert!(
        send_group0_peer_exchange(client.as_ref(), &a.info, &peers, Duration::from_secs(1))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_remove_unmapped_address_sends_nothing() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let keyspace = SystemKeyspace::in_memory();
    keyspace.set_raft_server_id(ServerId::new_random()).await.unwrap();
    let a = TestNode::with_keyspace(&network, &cluster, "a:1", &["b:1"], keyspace, true);

    a.group0
        .remove_from_group0(&ServerInfo::from("z:1"))
        .await
        .unwrap();
    assert_eq!(a.messaging.total_sent(), 0);
}

#[tokio::test]
async fn test_remove_without_identity_is_rejected() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);

    let result = a.group0.remove_from_group0(&ServerInfo::from("b:1")).await;
    assert!(matches!(result, Err(ZerothError::NotClusterMember(_))));
}

#[tokio::test]
async fn test_member_removes_peer_through_local_server() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);
    a.group0.setup_group0().await.unwrap();
    let b = TestNode::new(&network, &cluster, "b:1", &["a:1"]);
    b.group0.setup_group0().await.unwrap();
    let gid = a.group0.group0_id().unwrap();
    let b_addr = b.my_addr().await;

    // A's ticker learns B's address from the configuration
    let a_id = a.my_addr().await.id;
    wait_until(|| {
        a.registry
            .address_map()
            .find_replace_id(&b.info, a_id)
            .is_some()
    })
    .await;

    a.group0.remove_from_group0(&b.info).await.unwrap();
    assert!(!cluster.configuration(gid).contains(b_addr.id));
    assert_eq!(a.messaging.sent(Verb::Group0ModifyConfig), 0);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_non_member_removes_peer_through_discovered_member() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);
    a.group0.setup_group0().await.unwrap();
    let b = TestNode::new(&network, &cluster, "b:1", &["a:1"]);
    b.group0.setup_group0().await.unwrap();
    let gid = a.group0.group0_id().unwrap();
    let b_addr = b.my_addr().await;

    let keyspace = SystemKeyspace::in_memory();
    keyspace.set_raft_server_id(ServerId::new_random()).await.unwrap();
    let c = TestNode::with_keyspace(&network, &cluster, "c:1", &["a:1"], keyspace, true);
    c.registry.address_map().set(&b_addr);

    c.group0.remove_from_group0(&b.info).await.unwrap();
    assert!(!cluster.configuration(gid).contains(b_addr.id));
    assert_eq!(c.messaging.sent(Verb::Group0ModifyConfig), 1);
    assert!(!c.group0.joined_group0());

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_leave_group0() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);
    a.group0.setup_group0().await.unwrap();
    let b = TestNode::new(&network, &cluster, "b:1", &["a:1"]);

    // Not joined yet
    b.group0.leave_group0().await.unwrap();

    b.group0.setup_group0().await.unwrap();
    let gid = b.group0.group0_id().unwrap();
    let b_addr = b.my_addr().await;
    assert!(cluster.configuration(gid).contains(b_addr.id));

    b.group0.leave_group0().await.unwrap();
    assert!(!cluster.configuration(gid).contains(b_addr.id));

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_load_my_addr_requires_identity() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);

    assert!(matches!(
        a.group0.load_my_addr().await,
        Err(ZerothError::Internal(_))
    ));

    let created = a.group0.load_or_create_my_addr().await.unwrap();
    assert_eq!(created.info, a.info);
    assert_eq!(a.group0.load_or_create_my_addr().await.unwrap(), created);
    assert_eq!(a.group0.load_my_addr().await.unwrap(), created);
}

#[tokio::test]
async fn test_membership_hook_tracks_failure_detector_endpoints() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);
    a.group0.setup_group0().await.unwrap();
    let b = TestNode::new(&network, &cluster, "b:1", &["a:1"]);
    b.group0.setup_group0().await.unwrap();

    let endpoint = a.gossiper.direct_fd_pinger().allocate_id(&b.info);
    wait_until(|| a.registry.direct_fd().is_tracked(endpoint)).await;

    let b_addr = b.my_addr().await;
    b.group0.leave_group0().await.unwrap();
    wait_until(|| !a.registry.direct_fd().is_tracked(endpoint)).await;

    // A departed member no longer resolves, so removing it again is a no-op
    assert_eq!(a.registry.address_map().find(b_addr.id), None);
    a.group0.remove_from_group0(&b.info).await.unwrap();
    assert_eq!(a.messaging.sent(Verb::Group0ModifyConfig), 0);

    // A never tracks itself
    let own = a.gossiper.direct_fd_pinger().allocate_id(&a.info);
    assert!(!a.registry.direct_fd().is_tracked(own));

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_abort_closes_the_gate() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);
    a.group0.setup_group0().await.unwrap();
    let gid = a.group0.group0_id().unwrap();
    let a_addr = a.my_addr().await;

    // Demote so that become_voter has work to do
    a.registry
        .get_server(gid)
        .unwrap()
        .modify_config(vec![ConfigMember::non_voter(a_addr)], vec![])
        .await
        .unwrap();

    a.group0.abort().await;
    assert!(matches!(
        a.group0.become_voter().await,
        Err(ZerothError::GateClosed)
    ));
    a.registry.abort().await;
}

#[tokio::test(start_paused = true)]
async fn test_join_retries_after_transport_failure() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let gid = GroupId::new_time_ordered();
    let (_leader, member) = ScriptedMember::serve(&network, "leader:1", Some(gid), 2);
    let b = TestNode::new(&network, &cluster, "b:1", &["leader:1"]);

    let started = tokio::time::Instant::now();
    b.group0.setup_group0().await.unwrap();

    // Two failed requests, each followed by a pause, then success
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(b.messaging.sent(Verb::Group0ModifyConfig), 3);
    let b_addr = b.my_addr().await;
    let requests = member.requests.lock().clone();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(request.group0_id, gid);
        assert_eq!(request.add, vec![ConfigMember::non_voter(b_addr.clone())]);
        assert!(request.del.is_empty());
    }

    // One server across every attempt
    assert_eq!(b.factory.created(), 1);
    assert_eq!(b.registry.group_count(), 1);
    assert_eq!(b.group0.group0_id(), Some(gid));
    assert_eq!(b.keyspace.get_raft_group0_id().await.unwrap(), Some(gid));

    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_join_rejects_overlapping_clusters_and_can_retry() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let (leader, member) = ScriptedMember::serve(&network, "leader:1", None, 1);
    let b = TestNode::new(&network, &cluster, "b:1", &["leader:1"]);

    // The retry after the failed request discovers a different group
    let result = b.group0.setup_group0().await;
    assert!(matches!(result, Err(ZerothError::Configuration(_))));
    let handed_out = member.handed_out.lock().clone();
    assert!(handed_out.len() >= 2);
    assert_ne!(handed_out.first(), handed_out.last());
    assert_eq!(member.requests.lock().len(), 1);

    // Nothing persisted and no server left running
    assert!(!b.group0.joined_group0());
    assert_eq!(b.keyspace.get_raft_group0_id().await.unwrap(), None);
    assert!(!b.keyspace.bootstrap_complete().await.unwrap());
    assert_eq!(b.registry.group_count(), 0);
    assert!(
        b.factory.servers.lock()[0]
            .aborted
            .load(Ordering::SeqCst)
    );

    // The node still answers peers while unbootstrapped
    let peers = vec![Peer::unknown(ServerInfo::from("leader:1"))];
    let reply = send_group0_peer_exchange(leader.as_ref(), &b.info, &peers, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, PeerExchangeReply::NoInfo);

    // Once the seeds agree, joining the first group succeeds
    let first = handed_out[0];
    *member.fixed.lock() = Some(first);
    b.group0.setup_group0().await.unwrap();
    assert_eq!(b.group0.group0_id(), Some(first));
    assert_eq!(b.keyspace.get_raft_group0_id().await.unwrap(), Some(first));
    assert_eq!(b.registry.group_count(), 1);
    assert_eq!(b.factory.created(), 2);

    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_abort_waits_for_verbs_in_flight() {
    let network = LocalNetwork::new();
    let cluster = FakeCluster::new();
    let a = TestNode::new(&network, &cluster, "a:1", &["a:1"]);
    a.group0.setup_group0().await.unwrap();
    let gid = a.group0.group0_id().unwrap();

    cluster.set_commit_delay(Duration::from_secs(5));
    let client = network.join("client:1");
    let joiner = ServerAddress::new(ServerId::new_random(), ServerInfo::from("client:1"));
    let request = ModifyConfigRequest {
        group0_id: gid,
        add: vec![ConfigMember::non_voter(joiner.clone())],
        del: vec![],
    };
    let in_flight = tokio::spawn({
        let client = client.clone();
        let to = a.info.clone();
        let request = request.clone();
        async move {
            send_group0_modify_config(client.as_ref(), &to, &request, Duration::from_secs(30)).await
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = tokio::time::Instant::now();
    a.group0.abort().await;
    assert!(started.elapsed() >= Duration::from_secs(4));
    in_flight.await.unwrap().unwrap();
    assert!(cluster.configuration(gid).contains(joiner.id));

    // Refused once stopped
    assert!(
        send_group0_modify_config(client.as_ref(), &a.info, &request, Duration::from_secs(1))
            .await
            .is_err()
    );
    a.registry.abort().await;
}
