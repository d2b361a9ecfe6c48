//! Group 0 discovery state machine
//!
//! A pure, I/O-free state machine that decides which peers to contact next and
//! when this node may found group 0 itself. Peers are identified by their
//! location until their server id becomes known; the id then takes precedence.
//!
//! Every node knows at least its seeds. Each tick either asks the queued peers
//! for their peer lists, pauses, or elects this node. A node elects itself only
//! after every known peer has answered and no known id is smaller than its own.

use std::collections::{BTreeMap, BTreeSet};

use zeroth_api::PeerList;
use zeroth_common::{Peer, ServerAddress, ServerId, ServerInfo};

/// Next action of the discovery loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutput {
    /// This node founds group 0
    ElectSelf,
    /// Nothing to do until peers make progress
    Pause,
    /// Send each payload to its peer with a peer exchange
    RequestList(Vec<(Peer, PeerList)>),
}

#[derive(Debug, Clone)]
pub struct Discovery {
    me: ServerAddress,
    /// Known peers by location, self excluded
    peers: BTreeMap<ServerInfo, Option<ServerId>>,
    /// Peers to contact on the next tick
    requests: BTreeSet<ServerInfo>,
    /// Peers that answered a peer exchange
    responded: BTreeSet<ServerInfo>,
    is_leader: bool,
}

impl Discovery {
    pub fn new(me: ServerAddress, seeds: impl IntoIterator<Item = Peer>) -> Self {
        let mut discovery = Self {
            me,
            peers: BTreeMap::new(),
            requests: BTreeSet::new(),
            responded: BTreeSet::new(),
            is_leader: false,
        };
        discovery.merge(seeds);
        discovery
    }

    pub fn me(&self) -> &ServerAddress {
        &self.me
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Known peers, self excluded
    pub fn peers(&self) -> PeerList {
        self.peers
            .iter()
            .map(|(info, id)| Peer {
                id: *id,
                info: info.clone(),
            })
            .collect()
    }

    /// Self followed by every known peer
    fn peer_list(&self) -> PeerList {
        let mut list = Vec::with_capacity(self.peers.len() + 1);
        list.push(Peer::from(self.me.clone()));
        list.extend(self.peers());
        list
    }

    fn merge(&mut self, incoming: impl IntoIterator<Item = Peer>) {
        for peer in incoming {
            if peer.info == self.me.info || peer.id == Some(self.me.id) {
                continue;
            }

            // A known id names one peer only; the first location seen for it wins.
            if let Some(id) = peer.id
                && self.peers.values().any(|known| *known == Some(id))
            {
                continue;
            }

            match self.peers.get_mut(&peer.info) {
                Some(known @ None) => *known = peer.id,
                Some(Some(_)) => {}
                None => {
                    self.requests.insert(peer.info.clone());
                    self.peers.insert(peer.info, peer.id);
                }
            }
        }
    }

    fn smallest_known_id(&self) -> Option<ServerId> {
        self.peers.values().flatten().min().copied()
    }

    pub fn tick(&mut self) -> TickOutput {
        if self.is_leader {
            return TickOutput::ElectSelf;
        }

        if !self.requests.is_empty() {
            let payload = self.peer_list();
            let requests = std::mem::take(&mut self.requests);
            return TickOutput::RequestList(
                requests
                    .into_iter()
                    .map(|info| {
                        let id = self.peers.get(&info).copied().flatten();
                        (Peer { id, info }, payload.clone())
                    })
                    .collect(),
            );
        }

        let everyone_responded = self
            .peers
            .keys()
            .all(|info| self.responded.contains(info));
        if everyone_responded && self.smallest_known_id().is_none_or(|min| self.me.id <= min) {
            self.is_leader = true;
            return TickOutput::ElectSelf;
        }

        // Poll everyone again: a peer that already answered may have joined
        // group 0 since and will then answer with its descriptor.
        self.requests = self.peers.keys().cloned().collect();
        TickOutput::Pause
    }

    /// Handle a peer exchange from another discovering node. Returns the list
    /// to answer with, or `None` once this node elected itself.
    pub fn request(&mut self, peers: PeerList) -> Option<PeerList> {
        self.merge(peers);
        if self.is_leader {
            None
        } else {
            Some(self.peer_list())
        }
    }

    /// Handle the peer list `from` answered with
    pub fn response(&mut self, from: &Peer, peers: PeerList) {
        if from.info != self.me.info {
            self.responded.insert(from.info.clone());
        }
        self.merge(peers);
    }
}
