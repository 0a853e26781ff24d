use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use parley_types::events::{NewUserEvent, WsDelivery};

/// Timeout for handlers that leave the process (mail).
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(15);

/// What an event carries. Each topic expects one variant.
#[derive(Debug, Clone)]
pub enum EventPayload {
    UserCreated(NewUserEvent),
    SendPayload(WsDelivery),
}

/// Per-invocation context handed to every handler.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event: String,
    pub io_timeout: Duration,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: EventContext, payload: EventPayload) -> Result<()>;
}

/// In-process fire-and-forget publish/subscribe.
///
/// Handlers run on the runtime the bus was built with, never on the
/// publisher's task, so a publisher neither waits for nor sees their result.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    runtime: Handle,
    io_timeout: Duration,
}

impl EventBus {
    pub fn new(runtime: Handle, io_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                runtime,
                io_timeout,
            }),
        }
    }

    /// Bus bound to the runtime of the caller.
    pub fn current() -> Self {
        Self::new(Handle::current(), DEFAULT_IO_TIMEOUT)
    }

    /// Append `handler` to `event`. Registering the same handler twice makes
    /// it fire twice.
    pub fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner);
        debug!("Handler {} subscribed to {}", handler.name(), event);
        handlers.entry(event.to_string()).or_default().push(handler);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        let handlers = self.inner.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(event).map_or(0, Vec::len)
    }

    /// Spawn every handler of `event` with its own copy of `payload` and
    /// return immediately.
    pub fn publish(&self, event: &str, payload: EventPayload) {
        let snapshot: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.inner.handlers.read().unwrap_or_else(PoisonError::into_inner);
            match handlers.get(event) {
                Some(list) => list.clone(),
                None => {
                    debug!("No handlers for {}", event);
                    return;
                }
            }
        };

        for handler in snapshot {
            let ctx = EventContext {
                event: event.to_string(),
                io_timeout: self.inner.io_timeout,
            };
            let payload = payload.clone();
            self.inner.runtime.spawn(async move {
                if let Err(e) = handler.handle(ctx.clone(), payload).await {
                    warn!("Handler {} failed on {}: {:#}", handler.name(), ctx.event, e);
                }
            });
        }
    }
}
