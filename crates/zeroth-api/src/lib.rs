//! Zeroth API - Wire protocol and transports
//!
//! This crate provides:
//! - Verbs and message types exchanged between nodes
//! - A handler registry owned by each messaging service
//! - An HTTP transport and an in-process transport for tests

pub mod group0;
pub mod handler;
pub mod http;
pub mod local;
pub mod messaging;
pub mod verb;

pub use group0::{
    ConfigMember, Group0Info, Group0RpcHandler, ModifyConfigRequest, PeerExchangeReply, PeerList,
    register_group0_verbs, send_group0_modify_config, send_group0_peer_exchange,
    unregister_group0_verbs,
};
pub use handler::{HandlerRegistry, MessageHandler};
pub use http::HttpMessagingService;
pub use local::{LocalMessagingService, LocalNetwork};
pub use messaging::{MessagingService, send_message};
pub use verb::Verb;

/// Path prefix of the internal RPC endpoint served by every node
pub const RPC_PATH_PREFIX: &str = "/internal/v1/rpc";
