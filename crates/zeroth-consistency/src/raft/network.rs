// Raft network layer over the messaging service
// Outgoing openraft RPCs are wrapped in a group envelope and sent with the raft verbs

use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;
use zeroth_api::Verb;
use zeroth_common::{RpcError, ServerId, ServerInfo};

use super::types::TypeConfig;
use crate::rpc::RaftRpc;

/// Reply of an inbound raft verb: the engine's own result, carried verbatim
pub type RaftReply<T, E = openraft::error::Infallible> = Result<T, RaftError<ServerId, E>>;

/// Creates openraft connections that share the group's RPC adapter
pub struct OpenRaftNetworkFactory {
    rpc: Arc<RaftRpc>,
    timeout: Duration,
}

impl OpenRaftNetworkFactory {
    pub fn new(rpc: Arc<RaftRpc>, timeout: Duration) -> Self {
        Self { rpc, timeout }
    }
}

impl RaftNetworkFactory<TypeConfig> for OpenRaftNetworkFactory {
    type Network = OpenRaftConnection;

    async fn new_client(&mut self, target: ServerId, node: &BasicNode) -> Self::Network {
        OpenRaftConnection {
            target,
            info: ServerInfo::from(node.addr.as_str()),
            rpc: self.rpc.clone(),
            timeout: self.timeout,
        }
    }
}

/// Connection to one remote raft server
pub struct OpenRaftConnection {
    target: ServerId,
    info: ServerInfo,
    rpc: Arc<RaftRpc>,
    timeout: Duration,
}

impl OpenRaftConnection {
    async fn call<Req, Resp, E>(
        &self,
        verb: Verb,
        request: Req,
        option: &RPCOption,
    ) -> Result<Resp, RPCError<ServerId, BasicNode, RaftError<ServerId, E>>>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let timeout = option.hard_ttl().min(self.timeout);
        let reply: RaftReply<Resp, E> = self
            .rpc
            .send_to(&self.info, verb, request, timeout)
            .await
            .map_err(|e| {
                trace!("{} to {} failed: {}", verb, self.target, e);
                match e {
                    RpcError::Unreachable(..) => RPCError::Unreachable(Unreachable::new(&e)),
                    _ => RPCError::Network(NetworkError::new(&e)),
                }
            })?;
        reply.map_err(|e| {
            RPCError::RemoteError(RemoteError::new_with_node(
                self.target,
                BasicNode::new(self.info.as_str()),
                e,
            ))
        })
    }
}

impl RaftNetwork<TypeConfig> for OpenRaftConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<ServerId>, RPCError<ServerId, BasicNode, RaftError<ServerId>>>
    {
        self.call(Verb::RaftAppendEntries, req, &option).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<ServerId>,
        RPCError<ServerId, BasicNode, RaftError<ServerId, InstallSnapshotError>>,
    > {
        self.call(Verb::RaftInstallSnapshot, req, &option).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<ServerId>,
        option: RPCOption,
    ) -> Result<VoteResponse<ServerId>, RPCError<ServerId, BasicNode, RaftError<ServerId>>> {
        self.call(Verb::RaftVote, req, &option).await
    }
}
