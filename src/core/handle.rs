//! Running sync cores and the registry that shares them by name.
//!
//! Each core runs on its own OS thread with a current-thread tokio runtime,
//! so the database connection never leaves that thread and every message is
//! handled one at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::capability::{ContextStrategy, StorageStrategy};
use crate::config::EngineConfig;
use crate::core::SyncCore;
use crate::error::{Error, Result};
use crate::protocol::{RequestEnvelope, WorkerMessage};
use crate::storage::{open_store, KeyValueStore};
use crate::transport::ShapeTransport;

pub type PortId = u64;

/// Messages from clients to a core.
#[derive(Debug)]
pub enum CoreInbound {
    Connect {
        port: PortId,
        outbox: mpsc::UnboundedSender<WorkerMessage>,
    },
    Disconnect {
        port: PortId,
    },
    Request {
        port: PortId,
        envelope: RequestEnvelope,
    },
    Shutdown,
}

/// Everything needed to start a core.
#[derive(Clone)]
pub struct CoreParams {
    pub config: EngineConfig,
    pub storage: StorageStrategy,
    pub transport: Arc<dyn ShapeTransport>,
    pub key_value: Arc<dyn KeyValueStore>,
}

/// Cloneable handle to a running core.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    name: String,
    inbox: mpsc::UnboundedSender<CoreInbound>,
    next_port: Arc<AtomicU64>,
}

impl CoreHandle {
    /// Start a core over the database shared under `params.config.name`.
    pub fn spawn(params: CoreParams) -> Result<Self> {
        Self::start(params, ContextStrategy::Shared)
    }

    /// Start a core with a database of its own, for a single client.
    pub fn spawn_private(params: CoreParams) -> Result<Self> {
        Self::start(params, ContextStrategy::PerTab)
    }

    fn start(params: CoreParams, context: ContextStrategy) -> Result<Self> {
        let CoreParams {
            config,
            storage,
            transport,
            key_value,
        } = params;
        config.validate()?;
        let store = open_store(storage, context, &config, key_value)?;
        let name = config.name.clone();
        let (inbox, rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name(format!("less-shapes-{name}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to start sync core runtime");
                        return;
                    }
                };
                let core = SyncCore::new(config, store, transport);
                runtime.block_on(core.run(rx));
            })?;

        tracing::info!(name = %name, strategy = ?storage, context = ?context, "sync core started");
        Ok(Self {
            name,
            inbox,
            next_port: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The core thread has exited.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Open a new port to this core.
    pub fn connect(&self) -> Result<Port> {
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (outbox, messages) = mpsc::unbounded_channel();
        self.inbox
            .send(CoreInbound::Connect { port: id, outbox })
            .map_err(|_| Error::Disconnected)?;
        Ok(Port {
            id,
            inbox: self.inbox.clone(),
            messages,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.inbox.send(CoreInbound::Shutdown);
    }
}

/// One client's connection to a core: requests go in through `inbox`,
/// responses and broadcasts come back on `messages`.
#[derive(Debug)]
pub struct Port {
    pub id: PortId,
    pub inbox: mpsc::UnboundedSender<CoreInbound>,
    pub messages: mpsc::UnboundedReceiver<WorkerMessage>,
}

/// Cores shared by name. Every client connecting under the same name
/// reaches the same core.
#[derive(Debug, Clone, Default)]
pub struct ContextRegistry {
    cores: Arc<Mutex<HashMap<String, CoreHandle>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static ContextRegistry {
        static GLOBAL: OnceLock<ContextRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ContextRegistry::new)
    }

    /// The running core for `params.config.name`, started if absent or
    /// exited.
    pub fn get_or_spawn(&self, params: CoreParams) -> Result<CoreHandle> {
        let mut cores = self.cores.lock();
        if let Some(handle) = cores.get(&params.config.name) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            tracing::debug!(name = %params.config.name, "shared core exited, restarting");
        }
        let handle = CoreHandle::spawn(params)?;
        cores.insert(handle.name().to_string(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<CoreHandle> {
        self.cores
            .lock()
            .get(name)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Stop and forget the core registered under `name`.
    pub fn shutdown(&self, name: &str) {
        if let Some(handle) = self.cores.lock().remove(name) {
            handle.shutdown();
        }
    }

    pub fn shutdown_all(&self) {
        for (_, handle) in self.cores.lock().drain() {
            handle.shutdown();
        }
    }
}
