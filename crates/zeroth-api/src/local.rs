// In-process transport
// Nodes joined to one LocalNetwork call each other's handlers directly. Used to
// drive multi-node scenarios inside a single test runtime.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use zeroth_common::{RpcError, ServerInfo};

use crate::handler::HandlerRegistry;
use crate::messaging::MessagingService;
use crate::verb::Verb;

#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<ServerInfo, Weak<LocalMessagingService>>,
    unreachable: DashSet<ServerInfo>,
    cut_links: DashSet<(ServerInfo, ServerInfo)>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node at `info` and return its messaging service
    pub fn join(self: &Arc<Self>, info: impl Into<ServerInfo>) -> Arc<LocalMessagingService> {
        let info = info.into();
        let service = Arc::new(LocalMessagingService {
            info: info.clone(),
            network: self.clone(),
            handlers: HandlerRegistry::new(),
            sent: DashMap::new(),
        });
        self.nodes.insert(info, Arc::downgrade(&service));
        service
    }

    /// Make every call to `info` fail as unreachable, or restore it
    pub fn set_unreachable(&self, info: &ServerInfo, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(info.clone());
        } else {
            self.unreachable.remove(info);
        }
    }

    /// Cut the link between two nodes in both directions
    pub fn partition(&self, a: &ServerInfo, b: &ServerInfo) {
        self.cut_links.insert((a.clone(), b.clone()));
        self.cut_links.insert((b.clone(), a.clone()));
    }

    pub fn heal(&self) {
        self.cut_links.clear();
        self.unreachable.clear();
    }

    fn is_reachable(&self, from: &ServerInfo, to: &ServerInfo) -> bool {
        !self.unreachable.contains(to) && !self.cut_links.contains(&(from.clone(), to.clone()))
    }

    fn lookup(&self, info: &ServerInfo) -> Option<Arc<LocalMessagingService>> {
        self.nodes.get(info).and_then(|node| node.upgrade())
    }
}

pub struct LocalMessagingService {
    info: ServerInfo,
    network: Arc<LocalNetwork>,
    handlers: HandlerRegistry,
    sent: DashMap<Verb, usize>,
}

impl LocalMessagingService {
    /// Number of calls of `verb` this node has attempted
    pub fn sent(&self, verb: Verb) -> usize {
        self.sent.get(&verb).map(|count| *count).unwrap_or(0)
    }

    pub fn total_sent(&self) -> usize {
        self.sent.iter().map(|entry| *entry.value()).sum()
    }
}

#[async_trait::async_trait]
impl MessagingService for LocalMessagingService {
    fn local_info(&self) -> &ServerInfo {
        &self.info
    }

    fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    async fn send(
        &self,
        to: &ServerInfo,
        verb: Verb,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        *self.sent.entry(verb).or_insert(0) += 1;

        if !self.network.is_reachable(&self.info, to) {
            return Err(RpcError::Unreachable(
                to.to_string(),
                "link is down".to_string(),
            ));
        }
        let target = self.network.lookup(to).ok_or_else(|| {
            RpcError::Unreachable(to.to_string(), "no such node".to_string())
        })?;
        let handler = target.handlers.get(verb).ok_or_else(|| {
            RpcError::Remote(to.to_string(), format!("no handler registered for verb {}", verb))
        })?;

        match tokio::time::timeout(timeout, handler.handle(body)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(RpcError::Remote(to.to_string(), e.to_string())),
            Err(_) => Err(RpcError::Timeout(to.to_string(), timeout)),
        }
    }
}
