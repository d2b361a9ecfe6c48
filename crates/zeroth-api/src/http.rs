// HTTP transport for inter-node RPC
// Each verb is a POST to /internal/v1/rpc/{verb} on the target node

use std::time::Duration;

use tracing::trace;
use zeroth_common::{Result, RpcError, ServerInfo, ZerothError};

use crate::RPC_PATH_PREFIX;
use crate::handler::HandlerRegistry;
use crate::messaging::MessagingService;
use crate::verb::Verb;

/// Connect timeout for inter-node calls; the per-call timeout bounds the rest
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct HttpMessagingService {
    local: ServerInfo,
    client: reqwest::Client,
    handlers: HandlerRegistry,
}

impl HttpMessagingService {
    pub fn new(local: ServerInfo) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ZerothError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            local,
            client,
            handlers: HandlerRegistry::new(),
        })
    }

    fn url(to: &ServerInfo, verb: Verb) -> String {
        format!("http://{}{}/{}", to, RPC_PATH_PREFIX, verb)
    }
}

#[async_trait::async_trait]
impl MessagingService for HttpMessagingService {
    fn local_info(&self) -> &ServerInfo {
        &self.local
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
    ) -> std::result::Result<Vec<u8>, RpcError> {
        let url = Self::url(to, verb);
        trace!("Sending {} to {}", verb, url);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout(to.to_string(), timeout)
                } else {
                    RpcError::Unreachable(to.to_string(), e.to_string())
                }
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout(to.to_string(), timeout)
            } else {
                RpcError::Unreachable(to.to_string(), e.to_string())
            }
        })?;

        if !status.is_success() {
            return Err(RpcError::Remote(
                to.to_string(),
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }

        Ok(bytes.to_vec())
    }
}
