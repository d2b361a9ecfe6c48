// Messaging service abstraction
// A transport sends a verb with a JSON body to a peer and owns the registry of
// inbound handlers

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use zeroth_common::{RpcError, ServerInfo};

use crate::handler::HandlerRegistry;
use crate::verb::Verb;

#[async_trait::async_trait]
pub trait MessagingService: Send + Sync {
    /// Location this service is reachable at
    fn local_info(&self) -> &ServerInfo;

    /// Registry of inbound handlers served by this node
    fn handlers(&self) -> &HandlerRegistry;

    /// Send a raw body and wait for the raw reply, bounded by `timeout`
    async fn send(
        &self,
        to: &ServerInfo,
        verb: Verb,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError>;
}

/// Typed send: JSON-encode the request and decode the reply
pub async fn send_message<Req, Resp>(
    messaging: &dyn MessagingService,
    to: &ServerInfo,
    verb: Verb,
    request: &Req,
    timeout: Duration,
) -> Result<Resp, RpcError>
where
    Req: Serialize + Sync + ?Sized,
    Resp: DeserializeOwned,
{
    let body = serde_json::to_vec(request)?;
    let reply = messaging.send(to, verb, body, timeout).await?;
    Ok(serde_json::from_slice(&reply)?)
}
