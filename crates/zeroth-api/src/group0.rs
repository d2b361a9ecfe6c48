//! Group 0 wire protocol
//!
//! Two verbs are served by every node:
//!
//! | Verb                   | Request               | Reply               |
//! |------------------------|-----------------------|---------------------|
//! | `group0_peer_exchange` | [`PeerList`]          | [`PeerExchangeReply`] |
//! | `group0_modify_config` | [`ModifyConfigRequest`] | `()`              |
//!
//! Peer exchange diffuses discovery knowledge and lets a node that already
//! knows group 0 short-circuit the requester. Modify config forwards a
//! membership change to the local consensus server of the named group.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroth_common::{GroupId, Peer, RpcError, ServerAddress, ServerId, ServerInfo};

use crate::handler::MessageHandler;
use crate::messaging::{MessagingService, send_message};
use crate::verb::Verb;

/// Peers known to the sender, the sender itself included
pub type PeerList = Vec<Peer>;

/// Identifier of group 0 and a member able to serve membership requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group0Info {
    pub group0_id: GroupId,
    pub addr: ServerAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PeerExchangeReply {
    /// Bootstrap has not started here, or this node cannot answer yet
    NoInfo,
    /// This node is discovering too and shares what it knows
    PeerList(PeerList),
    /// This node knows group 0; the requester can stop discovering
    Group0Info(Group0Info),
}

/// A member of a consensus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMember {
    pub addr: ServerAddress,
    pub can_vote: bool,
}

impl ConfigMember {
    pub fn voter(addr: ServerAddress) -> Self {
        Self {
            addr,
            can_vote: true,
        }
    }

    pub fn non_voter(addr: ServerAddress) -> Self {
        Self {
            addr,
            can_vote: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyConfigRequest {
    pub group0_id: GroupId,
    pub add: Vec<ConfigMember>,
    pub del: Vec<ServerId>,
}

/// Server side of the group 0 verbs
#[async_trait::async_trait]
pub trait Group0RpcHandler: Send + Sync {
    async fn peer_exchange(&self, peers: PeerList) -> anyhow::Result<PeerExchangeReply>;

    async fn modify_config(&self, request: ModifyConfigRequest) -> anyhow::Result<()>;
}

struct PeerExchangeVerb(Arc<dyn Group0RpcHandler>);

#[async_trait::async_trait]
impl MessageHandler for PeerExchangeVerb {
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let peers: PeerList = serde_json::from_slice(&body)?;
        let reply = self.0.peer_exchange(peers).await?;
        Ok(serde_json::to_vec(&reply)?)
    }
}

struct ModifyConfigVerb(Arc<dyn Group0RpcHandler>);

#[async_trait::async_trait]
impl MessageHandler for ModifyConfigVerb {
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let request: ModifyConfigRequest = serde_json::from_slice(&body)?;
        self.0.modify_config(request).await?;
        Ok(serde_json::to_vec(&())?)
    }
}

pub fn register_group0_verbs(messaging: &dyn MessagingService, handler: Arc<dyn Group0RpcHandler>) {
    messaging.handlers().register(
        Verb::Group0PeerExchange,
        Arc::new(PeerExchangeVerb(handler.clone())),
    );
    messaging
        .handlers()
        .register(Verb::Group0ModifyConfig, Arc::new(ModifyConfigVerb(handler)));
}

pub fn unregister_group0_verbs(messaging: &dyn MessagingService) {
    messaging.handlers().unregister(Verb::Group0PeerExchange);
    messaging.handlers().unregister(Verb::Group0ModifyConfig);
}

pub async fn send_group0_peer_exchange(
    messaging: &dyn MessagingService,
    to: &ServerInfo,
    peers: &PeerList,
    timeout: Duration,
) -> Result<PeerExchangeReply, RpcError> {
    send_message(messaging, to, Verb::Group0PeerExchange, peers, timeout).await
}

pub async fn send_group0_modify_config(
    messaging: &dyn MessagingService,
    to: &ServerInfo,
    request: &ModifyConfigRequest,
    timeout: Duration,
) -> Result<(), RpcError> {
    send_message(messaging, to, Verb::Group0ModifyConfig, request, timeout).await
}
