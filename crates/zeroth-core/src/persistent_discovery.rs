//! Durable group 0 discovery
//!
//! Wraps [`Discovery`] with the system keyspace so a restarted node resumes
//! from every peer it has seen, and with a gate so [`PersistentDiscovery::stop`]
//! waits for in-flight peer exchanges before the instance is dropped.
//!
//! `tick` is not guarded by the gate: the caller stops discovery only after
//! its own tick loop has returned.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use zeroth_api::{
    Group0Info, MessagingService, PeerExchangeReply, PeerList, send_group0_peer_exchange,
};
use zeroth_common::{
    Gate, GateHolder, GroupId, Peer, Result, ServerAddress, ZerothError, sleep_abortable,
};
use zeroth_consistency::SystemKeyspace;

use crate::discovery::{Discovery, TickOutput};

/// Deadline of one peer exchange
pub const PEER_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay between polling rounds
pub const DISCOVERY_PAUSE: Duration = Duration::from_secs(1);

pub struct PersistentDiscovery {
    discovery: Mutex<Discovery>,
    keyspace: SystemKeyspace,
    gate: Gate,
}

impl PersistentDiscovery {
    /// Peers loaded from disk come first so a seed never overrides an id
    /// learned in an earlier run.
    pub async fn make(me: ServerAddress, seeds: PeerList, keyspace: SystemKeyspace) -> Result<Self> {
        let mut peers = keyspace.load_discovered_peers().await?;
        for peer in &peers {
            debug!("discovery: persisted peer: id={:?}, info={}", peer.id, peer.info);
        }
        for seed in &seeds {
            debug!("discovery: seed peer: id={:?}, info={}", seed.id, seed.info);
        }
        peers.extend(seeds);

        Ok(Self {
            discovery: Mutex::new(Discovery::new(me, peers)),
            keyspace,
            gate: Gate::new(),
        })
    }

    pub fn peers(&self) -> PeerList {
        self.discovery.lock().peers()
    }

    async fn store(&self) -> Result<()> {
        let peers = self.peers();
        self.keyspace.store_discovered_peers(&peers).await
    }

    /// Answer a peer exchange from another discovering node
    pub async fn request(&self, peers: PeerList) -> Result<Option<PeerList>> {
        for peer in &peers {
            debug!("discovery: request peer: id={:?}, info={}", peer.id, peer.info);
        }

        let Ok(_holder) = self.gate.hold() else {
            // Stopped, about to be dropped
            return Ok(None);
        };
        let reply = self.discovery.lock().request(peers);
        self.store().await?;
        Ok(reply)
    }

    /// Merge the peer list `from` answered with
    pub async fn response(&self, from: &Peer, peers: PeerList) -> Result<()> {
        for peer in &peers {
            debug!("discovery: response peer: id={:?}, info={}", peer.id, peer.info);
        }

        let Ok(_holder) = self.gate.hold() else {
            return Ok(());
        };
        self.discovery.lock().response(from, peers);
        self.store().await
    }

    pub async fn tick(&self) -> Result<TickOutput> {
        let output = self.discovery.lock().tick();
        self.store().await?;
        Ok(output)
    }

    /// Close the gate and wait for in-flight requests and responses
    pub async fn stop(&self) {
        self.gate.close().await;
    }

    /// Poll peers until group 0 is found or this node founds it.
    ///
    /// `_pause_shutdown` keeps the owner's shutdown gate open for the duration.
    /// Only the pause observes `abort`; peer exchanges rely on their deadline.
    pub async fn run(
        &self,
        messaging: &dyn MessagingService,
        _pause_shutdown: GateHolder,
        abort: &CancellationToken,
        my_addr: ServerAddress,
    ) -> Result<Group0Info> {
        loop {
            let requests = match self.tick().await? {
                TickOutput::ElectSelf => {
                    return Ok(Group0Info {
                        group0_id: GroupId::new_time_ordered(),
                        addr: my_addr,
                    });
                }
                TickOutput::Pause => {
                    trace!("server {} pausing discovery...", my_addr.id);
                    sleep_abortable(DISCOVERY_PAUSE, abort).await?;
                    continue;
                }
                TickOutput::RequestList(requests) => requests,
            };

            let mut in_flight: FuturesUnordered<_> = requests
                .into_iter()
                .map(|(peer, payload)| async move {
                    trace!("sending discovery message to {}", peer.info);
                    let reply = send_group0_peer_exchange(
                        messaging,
                        &peer.info,
                        &payload,
                        PEER_EXCHANGE_TIMEOUT,
                    )
                    .await;
                    (peer, reply)
                })
                .collect();

            // First group 0 descriptor wins; the remaining exchanges are dropped.
            while let Some((peer, reply)) = in_flight.next().await {
                match reply {
                    Ok(PeerExchangeReply::PeerList(peers)) => self.response(&peer, peers).await?,
                    Ok(PeerExchangeReply::Group0Info(info)) => return Ok(info),
                    Ok(PeerExchangeReply::NoInfo) => {}
                    Err(e) if e.is_transport() => {
                        trace!("failed to send message to {}: {}", peer.info, e);
                    }
                    Err(e) => return Err(ZerothError::Rpc(e)),
                }
            }
        }
    }
}
