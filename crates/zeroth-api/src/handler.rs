// Handler registry for inbound RPCs
// Each messaging service owns one registry; components register at startup and
// unregister at shutdown

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::verb::Verb;

/// Handler for one verb. Bodies are JSON-encoded by the typed helpers.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<Verb, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same verb
    pub fn register(&self, verb: Verb, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(verb, handler).is_some() {
            warn!("Replaced existing handler for verb {}", verb);
        } else {
            debug!("Registered handler for verb {}", verb);
        }
    }

    pub fn unregister(&self, verb: Verb) -> bool {
        let removed = self.handlers.remove(&verb).is_some();
        if removed {
            debug!("Unregistered handler for verb {}", verb);
        }
        removed
    }

    pub fn get(&self, verb: Verb) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&verb).map(|h| h.value().clone())
    }

    pub fn is_registered(&self, verb: Verb) -> bool {
        self.handlers.contains_key(&verb)
    }

    /// Run the handler for `verb`. The handler is cloned out of the map before
    /// it is awaited so registration changes never wait on a running handler.
    pub async fn dispatch(&self, verb: Verb, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let handler = self
            .get(verb)
            .ok_or_else(|| anyhow::anyhow!("no handler registered for verb {}", verb))?;
        handler.handle(body).await
    }
}
