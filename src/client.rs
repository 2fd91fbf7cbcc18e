//! RPC client: the per-tab API over an execution adapter.
//!
//! Every call gets a fresh request id and a oneshot channel keyed by that id.
//! The call races the response against the configured timeout; on timeout
//! the id is removed, so a late response finds nothing and is dropped.
//! Broadcasts update a mirrored `EngineStatus` and fan out to listeners.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, OnceCell};

use crate::adapter::ExecutionAdapter;
use crate::capability::{self, Capabilities, Environment};
use crate::config::EngineConfig;
use crate::core::{ContextRegistry, CoreParams};
use crate::error::{Error, Result};
use crate::protocol::{Broadcast, Request, RequestEnvelope, ResponseBody, ResponseEnvelope, WorkerMessage};
use crate::storage::{KeyValueStore, MemoryKeyValueStore};
use crate::transport::{HttpTransport, ShapeTransport};
use crate::types::{
    ChangeEvent, EngineStatus, ExecResult, InitResult, Pong, ResetAck, Row, SchemaResetEvent,
    ShapeAck, ShapeDefinition,
};

/// Removes the listener it was returned for. Calling it is optional; the
/// listener is dropped with the client either way.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

type DataListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
type ResetListener = Arc<dyn Fn(&SchemaResetEvent) + Send + Sync>;
type StatusListener = Arc<dyn Fn(&EngineStatus) + Send + Sync>;

/// Host collaborators a client runs against.
#[derive(Clone)]
pub struct Host {
    pub registry: ContextRegistry,
    pub transport: Arc<dyn ShapeTransport>,
    pub key_value: Arc<dyn KeyValueStore>,
    pub environment: Environment,
}

impl Host {
    /// Global registry, HTTP transport, process-wide key-value store, and an
    /// environment built from `config.data_dir`.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            registry: ContextRegistry::global().clone(),
            transport: Arc::new(HttpTransport::new(config)?),
            key_value: Arc::new(MemoryKeyValueStore::shared()),
            environment: Environment::new(config.data_dir.clone()),
        })
    }
}

#[derive(Default)]
struct Listeners {
    data: HashMap<String, Vec<(u64, DataListener)>>,
    reset: Vec<(u64, ResetListener)>,
    status: Vec<(u64, StatusListener)>,
}

#[derive(Default)]
struct ClientInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>,
    status: Mutex<EngineStatus>,
    capabilities: Mutex<Option<Capabilities>>,
    listeners: Mutex<Listeners>,
    next_listener: AtomicU64,
}

pub struct SyncClient {
    config: EngineConfig,
    host: Host,
    adapter: OnceCell<ExecutionAdapter>,
    inner: Arc<ClientInner>,
}

impl SyncClient {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let host = Host::new(&config)?;
        Self::with_host(config, host)
    }

    pub fn with_host(config: EngineConfig, host: Host) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            host,
            adapter: OnceCell::new(),
            inner: Arc::new(ClientInner::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Detect capabilities and connect to a sync core. Only the first call
    /// does anything; later calls return once that connection exists.
    pub async fn connect(&self) -> Result<()> {
        self.adapter
            .get_or_try_init(|| async {
                let caps = capability::detect(&self.host.environment);
                *self.inner.capabilities.lock() = Some(caps);

                let mut config = self.config.clone();
                if config.data_dir.is_none() {
                    config.data_dir = self.host.environment.data_dir.clone();
                }
                let params = CoreParams {
                    config,
                    storage: caps.storage_strategy,
                    transport: Arc::clone(&self.host.transport),
                    key_value: Arc::clone(&self.host.key_value),
                };
                let adapter =
                    ExecutionAdapter::open(caps.context_strategy, &self.host.registry, params)
                        .inspect_err(|e| self.inner.status.lock().error = Some(e.to_string()))?;

                let inner = Arc::downgrade(&self.inner);
                adapter.on_message(move |msg| {
                    if let Some(inner) = inner.upgrade() {
                        inner.dispatch(msg);
                    }
                });
                Ok::<_, Error>(adapter)
            })
            .await?;
        Ok(())
    }

    /// Disconnect from the core. Calls in flight fail with `Disconnected`.
    pub fn disconnect(&self) {
        if let Some(adapter) = self.adapter.get() {
            adapter.dispose();
        }
        self.inner.pending.lock().clear();
    }

    /// Strategies chosen at connect time.
    pub fn capabilities(&self) -> Option<Capabilities> {
        *self.inner.capabilities.lock()
    }

    /// The mirrored engine status.
    pub fn status(&self) -> EngineStatus {
        self.inner.status.lock().clone()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    async fn request(&self, request: Request) -> Result<ResponseBody> {
        self.connect().await?;
        let adapter = self.adapter.get().ok_or(Error::Disconnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        tracing::trace!(id, kind = request.tag(), "sending request");
        if let Err(e) = adapter.send(RequestEnvelope { id, request }) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(ResponseBody::Error { error })) => Err(Error::Remote(error)),
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                tracing::warn!(id, "request timed out");
                Err(Error::Timeout {
                    id,
                    timeout_ms: self.config.request_timeout_ms,
                })
            }
        }
    }

    pub async fn init(&self) -> Result<InitResult> {
        match self.request(Request::Init).await? {
            ResponseBody::InitResult { result } => Ok(result),
            other => Err(unexpected("INIT_RESULT", &other)),
        }
    }

    /// Start mirroring a shape. Resolves once the initial snapshot is in the
    /// local table, or immediately if the shape is already active.
    pub async fn sync_shape(&self, def: ShapeDefinition) -> Result<ShapeAck> {
        match self.request(Request::sync_shape(def)).await? {
            ResponseBody::SyncShapeResult { result } => Ok(result),
            other => Err(unexpected("SYNC_SHAPE_RESULT", &other)),
        }
    }

    /// Stop a shape. Its rows stay in the local table.
    pub async fn stop_shape(&self, shape_name: &str) -> Result<ShapeAck> {
        let request = Request::StopShape {
            shape_name: shape_name.to_string(),
        };
        match self.request(request).await? {
            ResponseBody::StopShapeResult { result } => Ok(result),
            other => Err(unexpected("STOP_SHAPE_RESULT", &other)),
        }
    }

    pub async fn force_reset(&self) -> Result<ResetAck> {
        match self.request(Request::ForceReset).await? {
            ResponseBody::ForceResetResult { result } => Ok(result),
            other => Err(unexpected("FORCE_RESET_RESULT", &other)),
        }
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let request = Request::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        match self.request(request).await? {
            ResponseBody::QueryResult { result } => Ok(result),
            other => Err(unexpected("QUERY_RESULT", &other)),
        }
    }

    pub async fn exec(&self, sql: &str) -> Result<ExecResult> {
        let request = Request::Exec {
            sql: sql.to_string(),
        };
        match self.request(request).await? {
            ResponseBody::ExecResult { result } => Ok(result),
            other => Err(unexpected("EXEC_RESULT", &other)),
        }
    }

    /// Fetch the authoritative status and refresh the mirror with it.
    pub async fn get_status(&self) -> Result<EngineStatus> {
        match self.request(Request::GetStatus).await? {
            ResponseBody::GetStatusResult { result } => {
                *self.inner.status.lock() = result.clone();
                Ok(result)
            }
            other => Err(unexpected("GET_STATUS_RESULT", &other)),
        }
    }

    pub async fn ping(&self) -> Result<Pong> {
        match self.request(Request::Ping).await? {
            ResponseBody::PingResult { result } => Ok(result),
            other => Err(unexpected("PING_RESULT", &other)),
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Call `callback` for every change event of `shape_name`.
    pub fn on_data_change(
        &self,
        shape_name: &str,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let shape = shape_name.to_string();
        self.inner
            .listeners
            .lock()
            .data
            .entry(shape.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let weak = Arc::downgrade(&self.inner);
        Box::new(move || {
            with_listeners(&weak, |l| {
                if let Some(list) = l.data.get_mut(&shape) {
                    list.retain(|(i, _)| *i != id);
                    if list.is_empty() {
                        l.data.remove(&shape);
                    }
                }
            })
        })
    }

    pub fn on_schema_reset(
        &self,
        callback: impl Fn(&SchemaResetEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .reset
            .push((id, Arc::new(callback)));
        let weak = Arc::downgrade(&self.inner);
        Box::new(move || with_listeners(&weak, |l| l.reset.retain(|(i, _)| *i != id)))
    }

    /// Call `callback` with the mirrored status after every status broadcast.
    pub fn on_status_change(
        &self,
        callback: impl Fn(&EngineStatus) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .status
            .push((id, Arc::new(callback)));
        let weak = Arc::downgrade(&self.inner);
        Box::new(move || with_listeners(&weak, |l| l.status.retain(|(i, _)| *i != id)))
    }
}

fn with_listeners(inner: &Weak<ClientInner>, f: impl FnOnce(&mut Listeners)) {
    if let Some(inner) = inner.upgrade() {
        f(&mut inner.listeners.lock());
    }
}

fn unexpected(expected: &str, body: &ResponseBody) -> Error {
    Error::protocol(format!("expected {expected}, got {body:?}"))
}

/// Invoke each listener outside any lock. A panicking listener is logged and
/// does not stop the others.
fn notify<T>(listeners: Vec<Arc<dyn Fn(&T) + Send + Sync>>, value: &T) {
    for listener in listeners {
        if panic::catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
            tracing::error!("listener panicked");
        }
    }
}

impl ClientInner {
    fn dispatch(&self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Response(ResponseEnvelope { id, body }) => {
                let sender = self.pending.lock().remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => tracing::trace!(id, "dropping response for unknown or timed-out request"),
                }
            }
            WorkerMessage::Broadcast(broadcast) => self.apply_broadcast(broadcast),
        }
    }

    fn apply_broadcast(&self, broadcast: Broadcast) {
        let status = {
            let mut status = self.status.lock();
            match &broadcast {
                Broadcast::Connected {
                    is_ready,
                    is_initializing,
                    error,
                    connected_tabs,
                    active_shapes,
                    schema_version,
                } => {
                    status.is_ready = *is_ready;
                    status.is_initializing = *is_initializing;
                    status.error = error.clone();
                    status.connected_tab_count = *connected_tabs;
                    status.active_shape_names = active_shapes.clone();
                    status.schema_version = schema_version.clone();
                }
                Broadcast::DbReady { schema_version } => {
                    status.is_ready = true;
                    status.is_initializing = false;
                    status.error = None;
                    status.schema_version = Some(schema_version.clone());
                }
                Broadcast::DbError { error } => {
                    status.is_ready = false;
                    status.is_initializing = false;
                    status.error = Some(error.clone());
                }
                Broadcast::ShapeSynced { shape_name, .. } => {
                    if !status.active_shape_names.contains(shape_name) {
                        status.active_shape_names.push(shape_name.clone());
                    }
                }
                Broadcast::ShapeStopped { shape_name } => {
                    status.active_shape_names.retain(|s| s != shape_name);
                }
                Broadcast::SchemaReset { .. } => status.active_shape_names.clear(),
                Broadcast::DataChange { .. } => {}
            }
            status.clone()
        };

        match broadcast {
            Broadcast::DataChange {
                shape_name,
                table_name,
                changes,
            } => {
                let listeners: Vec<DataListener> = self
                    .listeners
                    .lock()
                    .data
                    .get(&shape_name)
                    .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
                    .unwrap_or_default();
                let event = ChangeEvent {
                    shape_name,
                    table_name,
                    changes,
                };
                notify(listeners, &event);
            }
            Broadcast::SchemaReset {
                reason,
                old_version,
                new_version,
            } => {
                let listeners: Vec<ResetListener> = self
                    .listeners
                    .lock()
                    .reset
                    .iter()
                    .map(|(_, f)| Arc::clone(f))
                    .collect();
                let event = SchemaResetEvent {
                    reason,
                    old_version,
                    new_version,
                };
                notify(listeners, &event);
                self.notify_status(&status);
            }
            _ => self.notify_status(&status),
        }
    }

    fn notify_status(&self, status: &EngineStatus) {
        let listeners: Vec<StatusListener> = self
            .listeners
            .lock()
            .status
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        notify(listeners, status);
    }
}
