//! Shared test fixtures: a scripted transport and a harness that builds
//! clients against it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use less_shapes::{
    capability::Environment, client::Host, ContextRegistry, EngineConfig, MemoryKeyValueStore,
    Row, ShapeBatch, ShapeRequest, ShapeTransport, SyncClient, TransportError,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const SCHEMA_URL: &str = "http://api.test/schema-version";
pub const WORKSPACES_URL: &str = "http://api.test/v1/shape?table=workspaces";
pub const WORKSPACES_DDL: &str =
    "CREATE TABLE workspaces (id INTEGER PRIMARY KEY, name TEXT NOT NULL)";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

type Scripted = Result<ShapeBatch, TransportError>;

struct Queue {
    tx: mpsc::UnboundedSender<Scripted>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Scripted>>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

/// A `ShapeTransport` answering from per-URL queues. A fetch against an
/// empty queue waits until something is pushed, like a long-poll with no
/// new data.
pub struct ScriptedTransport {
    version: Mutex<Result<String, TransportError>>,
    queues: Mutex<HashMap<String, Queue>>,
    requests: Mutex<Vec<ShapeRequest>>,
}

impl ScriptedTransport {
    pub fn new(version: &str) -> Self {
        Self {
            version: Mutex::new(Ok(version.to_string())),
            queues: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock().unwrap() = Ok(version.to_string());
    }

    pub fn fail_version(&self, error: TransportError) {
        *self.version.lock().unwrap() = Err(error);
    }

    pub fn push(&self, url: &str, batch: ShapeBatch) {
        self.push_result(url, Ok(batch));
    }

    pub fn push_error(&self, url: &str, error: TransportError) {
        self.push_result(url, Err(error));
    }

    fn push_result(&self, url: &str, item: Scripted) {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(url.to_string()).or_insert_with(Queue::new);
        queue.tx.send(item).unwrap();
    }

    /// Requests issued for `url` so far.
    pub fn requests_for(&self, url: &str) -> Vec<ShapeRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ShapeTransport for ScriptedTransport {
    async fn fetch_shape(&self, request: &ShapeRequest) -> Result<ShapeBatch, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let rx = {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues
                .entry(request.url.clone())
                .or_insert_with(Queue::new);
            Arc::clone(&queue.rx)
        };
        let next = rx.lock().await.recv().await;
        match next {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }

    async fn fetch_schema_version(&self, _url: &str) -> Result<String, TransportError> {
        self.version.lock().unwrap().clone()
    }
}

/// One simulated origin: a registry of shared cores, a data directory and a
/// scripted server.
pub struct Harness {
    pub transport: Arc<ScriptedTransport>,
    pub registry: ContextRegistry,
    pub key_value: Arc<MemoryKeyValueStore>,
    pub environment: Environment,
    _dir: Option<TempDir>,
}

impl Harness {
    /// Shared contexts and a file-backed store in a temp directory.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let environment = Environment::new(Some(dir.path().to_path_buf()));
        Self::build(environment, Some(dir))
    }

    /// Private cores per client, each with a file-backed store.
    pub fn per_tab_files() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let environment = Environment {
            shared_contexts: false,
            data_dir: Some(dir.path().to_path_buf()),
        };
        Self::build(environment, Some(dir))
    }

    /// No shared contexts and no file system.
    pub fn isolated() -> Self {
        Self::build(Environment::isolated(), None)
    }

    fn build(environment: Environment, dir: Option<TempDir>) -> Self {
        Self {
            transport: Arc::new(ScriptedTransport::new("v1")),
            registry: ContextRegistry::new(),
            key_value: Arc::new(MemoryKeyValueStore::new()),
            environment,
            _dir: dir,
        }
    }

    /// Data directory of a file-backed harness.
    pub fn data_dir(&self) -> &std::path::Path {
        self._dir.as_ref().map(TempDir::path).unwrap()
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::new(SCHEMA_URL)
            .with_name("test-db")
            .with_retry(Duration::from_millis(10), Duration::from_millis(50))
    }

    pub fn host(&self) -> Host {
        Host {
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            key_value: self.key_value.clone(),
            environment: self.environment.clone(),
        }
    }

    pub fn client(&self) -> SyncClient {
        self.client_with(self.config())
    }

    pub fn client_with(&self, config: EngineConfig) -> SyncClient {
        SyncClient::with_host(config, self.host()).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.registry.shutdown_all();
    }
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

pub fn rows(values: &[Value]) -> Vec<Row> {
    values.iter().cloned().map(row).collect()
}

/// Receive the next item or fail the test after `WAIT`.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
