//! Uniform connection to a sync core, whichever context strategy is in use.
//!
//! Under `Shared` the adapter connects a new port to the named core in the
//! registry; under `PerTab` it starts a private core and shuts it down on
//! dispose. Either way callers only see `send`, `on_message` and `dispose`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capability::ContextStrategy;
use crate::core::handle::{CoreInbound, PortId};
use crate::core::{ContextRegistry, CoreHandle, CoreParams};
use crate::error::{Error, Result};
use crate::protocol::{RequestEnvelope, WorkerMessage};

pub type MessageHandler = Arc<dyn Fn(WorkerMessage) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    handlers: Vec<MessageHandler>,
    /// Messages that arrived before the first handler was registered.
    backlog: Vec<WorkerMessage>,
}

pub struct ExecutionAdapter {
    strategy: ContextStrategy,
    core: CoreHandle,
    port: PortId,
    inbox: mpsc::UnboundedSender<CoreInbound>,
    handlers: Arc<Mutex<Handlers>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ExecutionAdapter {
    /// Connect and start listening. Must be called inside a tokio runtime.
    pub fn open(
        strategy: ContextStrategy,
        registry: &ContextRegistry,
        params: CoreParams,
    ) -> Result<Self> {
        let core = match strategy {
            ContextStrategy::Shared => registry.get_or_spawn(params)?,
            ContextStrategy::PerTab => CoreHandle::spawn_private(params)?,
        };
        let port = core.connect()?;
        let handlers = Arc::new(Mutex::new(Handlers::default()));
        let pump = tokio::spawn(pump(port.messages, Arc::clone(&handlers)));
        tracing::debug!(strategy = ?strategy, port = port.id, core = core.name(), "adapter connected");
        Ok(Self {
            strategy,
            core,
            port: port.id,
            inbox: port.inbox,
            handlers,
            pump: Mutex::new(Some(pump)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn strategy(&self) -> ContextStrategy {
        self.strategy
    }

    pub fn send(&self, envelope: RequestEnvelope) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disconnected);
        }
        self.inbox
            .send(CoreInbound::Request {
                port: self.port,
                envelope,
            })
            .map_err(|_| Error::Disconnected)
    }

    /// Register a handler for every message from the core. The first handler
    /// also receives anything that arrived before it was registered.
    pub fn on_message(&self, handler: impl Fn(WorkerMessage) + Send + Sync + 'static) {
        let handler: MessageHandler = Arc::new(handler);
        let backlog = {
            let mut state = self.handlers.lock();
            state.handlers.push(Arc::clone(&handler));
            std::mem::take(&mut state.backlog)
        };
        for msg in backlog {
            handler(msg);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire) || self.inbox.is_closed()
    }

    /// Disconnect from the core. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inbox.send(CoreInbound::Disconnect { port: self.port });
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if self.strategy == ContextStrategy::PerTab {
            self.core.shutdown();
        }
        self.handlers.lock().handlers.clear();
        tracing::debug!(port = self.port, "adapter disposed");
    }
}

impl Drop for ExecutionAdapter {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn pump(mut messages: mpsc::UnboundedReceiver<WorkerMessage>, handlers: Arc<Mutex<Handlers>>) {
    while let Some(msg) = messages.recv().await {
        let current = {
            let mut state = handlers.lock();
            if state.handlers.is_empty() {
                state.backlog.push(msg);
                continue;
            }
            state.handlers.clone()
        };
        for handler in current {
            handler(msg.clone());
        }
    }
    tracing::debug!("core closed the port");
}
