//! The sync core: sole owner and writer of the embedded database.
//!
//! A core is an actor. Client requests, port connections and fetch-loop
//! batches all arrive as messages and are processed strictly one at a
//! time, so no two operations ever touch the database concurrently.

pub mod backoff;
pub mod handle;
pub mod schema;
pub mod shape;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    Broadcast, Request, RequestEnvelope, ResponseBody, ResponseEnvelope, WorkerMessage,
};
use crate::storage::{sqlite, LocalStore, META_SCHEMA_VERSION};
use crate::transport::{BatchPayload, ShapeBatch, ShapeTransport};
use crate::types::{
    EngineStatus, ExecResult, InitResult, Pong, ResetAck, Row, SchemaResetReason, ShapeAck,
    ShapeDefinition, ShapeState,
};

use self::backoff::Backoff;
use self::handle::{CoreInbound, PortId};
use self::schema::{SchemaPhase, VersionDecision};
use self::shape::{advance_token, FetchLoop, PendingReply, ShapeEvent, ShapeSubscription};

pub use self::handle::{ContextRegistry, CoreHandle, CoreParams, Port};

/// Broadcasts produced by a batch, plus the deferred `SYNC_SHAPE` reply it
/// completes, if any.
type BatchOutcome = (Vec<Broadcast>, Option<(PendingReply, ShapeAck)>);

pub(crate) struct SyncCore {
    config: EngineConfig,
    store: Box<dyn LocalStore>,
    transport: Arc<dyn ShapeTransport>,
    backoff: Backoff,
    phase: SchemaPhase,
    schema_version: Option<String>,
    error: Option<String>,
    ports: BTreeMap<PortId, mpsc::UnboundedSender<WorkerMessage>>,
    shapes: BTreeMap<String, ShapeSubscription>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<ShapeEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ShapeEvent>>,
}

impl SyncCore {
    pub fn new(
        config: EngineConfig,
        store: Box<dyn LocalStore>,
        transport: Arc<dyn ShapeTransport>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            backoff: Backoff::from_config(&config),
            config,
            store,
            transport,
            phase: SchemaPhase::Unknown,
            schema_version: None,
            error: None,
            ports: BTreeMap::new(),
            shapes: BTreeMap::new(),
            next_generation: 0,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Process messages until shutdown or until every client handle is gone.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<CoreInbound>) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(CoreInbound::Shutdown) | None => break,
                    Some(msg) => self.handle_inbound(msg).await,
                },
                Some(event) = events.recv() => self.handle_shape_event(event),
            }
        }
        self.discard_shapes("sync core shut down");
        tracing::info!(name = %self.config.name, "sync core stopped");
    }

    // ========================================================================
    // Inbound messages
    // ========================================================================

    async fn handle_inbound(&mut self, msg: CoreInbound) {
        match msg {
            CoreInbound::Connect { port, outbox } => {
                self.ports.insert(port, outbox);
                tracing::debug!(port, tabs = self.ports.len(), "port connected");
                self.broadcast(Broadcast::connected(&self.status()));
            }
            CoreInbound::Disconnect { port } => {
                if self.ports.remove(&port).is_some() {
                    tracing::debug!(port, tabs = self.ports.len(), "port disconnected");
                    self.broadcast(Broadcast::connected(&self.status()));
                }
            }
            CoreInbound::Request { port, envelope } => self.handle_request(port, envelope).await,
            CoreInbound::Shutdown => {}
        }
    }

    async fn handle_request(&mut self, port: PortId, envelope: RequestEnvelope) {
        let RequestEnvelope { id, request } = envelope;
        tracing::debug!(id, port, kind = request.tag(), "request");
        let reply = match request {
            Request::Init => self
                .init()
                .await
                .map(|result| Some(ResponseBody::InitResult { result })),
            Request::SyncShape {
                shape_name,
                table_name,
                shape_url,
                schema,
                live,
            } => {
                let def = ShapeDefinition {
                    shape_name,
                    table_name,
                    shape_url,
                    schema,
                    live,
                };
                self.sync_shape(def, PendingReply { port, id })
                    .map(|ack| ack.map(|result| ResponseBody::SyncShapeResult { result }))
            }
            Request::StopShape { shape_name } => Ok(Some(ResponseBody::StopShapeResult {
                result: self.stop_shape(&shape_name),
            })),
            Request::ForceReset => self
                .force_reset()
                .map(|result| Some(ResponseBody::ForceResetResult { result })),
            Request::Query { sql, params } => self
                .query(&sql, &params)
                .map(|result| Some(ResponseBody::QueryResult { result })),
            Request::Exec { sql } => self
                .exec(&sql)
                .map(|result| Some(ResponseBody::ExecResult { result })),
            Request::GetStatus => Ok(Some(ResponseBody::GetStatusResult {
                result: self.status(),
            })),
            Request::Ping => Ok(Some(ResponseBody::PingResult {
                result: Pong {
                    pong: true,
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                },
            })),
        };
        match reply {
            Ok(Some(body)) => self.respond(port, ResponseEnvelope { id, body }),
            // Answered later, once the shape reaches its first sync.
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(id, error = %e, "request failed");
                self.respond(port, ResponseEnvelope::error(id, e));
            }
        }
    }

    fn require_ready(&self) -> Result<()> {
        if self.phase.is_ready() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    // ========================================================================
    // init / forceReset
    // ========================================================================

    async fn init(&mut self) -> Result<InitResult> {
        self.phase = SchemaPhase::Checking;
        self.error = None;
        match self.reconcile_schema().await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::error!(error = %e, "init failed");
                // Fetch loops may not write into a database that is no longer
                // ready.
                self.discard_shapes("stopped because init failed");
                self.phase = SchemaPhase::Unknown;
                self.error = Some(e.to_string());
                self.broadcast(Broadcast::DbError {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn reconcile_schema(&mut self) -> Result<InitResult> {
        let persisted = self.store.get_meta(META_SCHEMA_VERSION)?;
        let fetched = self
            .transport
            .fetch_schema_version(&self.config.schema_version_url)
            .await;
        let decision = schema::decide(persisted, fetched)?;
        self.phase = decision.phase();

        match &decision {
            VersionDecision::FirstRun { version } => {
                tracing::info!(version = %version, "first run, creating fresh database");
                self.discard_shapes("database recreated");
                self.store.wipe()?;
            }
            VersionDecision::Matched { version } => {
                tracing::debug!(version = %version, "schema version matched");
            }
            VersionDecision::Mismatch { old, new } => {
                tracing::info!(old = %old, new = %new, "schema version changed, resetting database");
                self.discard_shapes("discarded by schema reset");
                self.store.wipe()?;
                self.broadcast(Broadcast::SchemaReset {
                    reason: SchemaResetReason::VersionMismatch,
                    old_version: Some(old.clone()),
                    new_version: Some(new.clone()),
                });
            }
            VersionDecision::Offline { version, error } => {
                tracing::warn!(
                    version = %version,
                    error = %error,
                    "schema version endpoint unreachable, continuing with persisted version"
                );
            }
        }

        let version = decision.version().to_string();
        self.store.set_meta(META_SCHEMA_VERSION, &version)?;
        self.mark_ready(version.clone());
        Ok(InitResult {
            success: true,
            schema_version: version,
            outcome: decision.outcome(),
        })
    }

    fn mark_ready(&mut self, version: String) {
        self.phase = SchemaPhase::Ready;
        self.schema_version = Some(version.clone());
        self.error = None;
        self.broadcast(Broadcast::DbReady {
            schema_version: version,
        });
    }

    fn force_reset(&mut self) -> Result<ResetAck> {
        tracing::info!("force reset requested");
        self.discard_shapes("discarded by force reset");
        if let Err(e) = self.store.wipe() {
            self.phase = SchemaPhase::Unknown;
            self.error = Some(e.to_string());
            self.broadcast(Broadcast::DbError {
                error: e.to_string(),
            });
            return Err(e);
        }
        let version = self.schema_version.clone();
        self.broadcast(Broadcast::SchemaReset {
            reason: SchemaResetReason::ForceReset,
            old_version: version.clone(),
            new_version: version.clone(),
        });
        match &version {
            Some(v) => {
                self.store.set_meta(META_SCHEMA_VERSION, v)?;
                self.mark_ready(v.clone());
            }
            // Never initialized: the caller still has to run init.
            None => self.phase = SchemaPhase::Unknown,
        }
        Ok(ResetAck {
            schema_version: version,
        })
    }

    // ========================================================================
    // Shapes
    // ========================================================================

    /// Register a shape. Returns `None` when the reply is deferred until the
    /// first sync completes.
    fn sync_shape(&mut self, def: ShapeDefinition, reply: PendingReply) -> Result<Option<ShapeAck>> {
        self.require_ready()?;
        sqlite::validate_identifier(&def.table_name)?;

        if let Some(existing) = self.shapes.get(&def.shape_name) {
            if existing.state.is_active() {
                tracing::debug!(shape = %def.shape_name, "shape already active");
                return Ok(Some(ShapeAck {
                    shape_name: def.shape_name,
                    record_count: None,
                    already_active: true,
                }));
            }
        }

        let conn = self.store.connection();
        if !sqlite::table_exists(conn, &def.table_name)? {
            if let Some(ddl) = &def.schema {
                conn.execute_batch(ddl)?;
                tracing::debug!(table = %def.table_name, "applied table DDL");
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let mut sub = ShapeSubscription::new(def.clone(), generation);
        sub.pending_reply = Some(reply);
        sub.task = Some(
            FetchLoop {
                shape: def.shape_name.clone(),
                generation,
                url: def.shape_url.clone(),
                table: def.table_name.clone(),
                live: def.live,
                transport: Arc::clone(&self.transport),
                events: self.events_tx.clone(),
                backoff: self.backoff,
            }
            .spawn(),
        );
        sub.state = ShapeState::Syncing;
        tracing::info!(shape = %def.shape_name, table = %def.table_name, live = def.live, "shape registered");
        self.shapes.insert(def.shape_name, sub);
        Ok(None)
    }

    fn stop_shape(&mut self, name: &str) -> ShapeAck {
        let pending = match self.shapes.get_mut(name) {
            Some(sub) if sub.state != ShapeState::Stopped => {
                sub.cancel();
                sub.state = ShapeState::Stopped;
                sub.token = Default::default();
                sub.pending_reply.take()
            }
            _ => {
                return ShapeAck {
                    shape_name: name.to_string(),
                    record_count: None,
                    already_active: false,
                }
            }
        };
        if let Some(reply) = pending {
            self.respond(reply.port, ResponseEnvelope::error(reply.id, format!("shape {name} was stopped")));
        }
        tracing::info!(shape = %name, "shape stopped");
        self.broadcast(Broadcast::ShapeStopped {
            shape_name: name.to_string(),
        });
        ShapeAck {
            shape_name: name.to_string(),
            record_count: None,
            already_active: false,
        }
    }

    /// Drop every subscription, failing any caller still waiting on one.
    fn discard_shapes(&mut self, reason: &str) {
        let shapes = std::mem::take(&mut self.shapes);
        for (name, mut sub) in shapes {
            sub.cancel();
            if let Some(reply) = sub.pending_reply.take() {
                self.respond(
                    reply.port,
                    ResponseEnvelope::error(reply.id, format!("shape {name} {reason}")),
                );
            }
        }
    }

    fn handle_shape_event(&mut self, event: ShapeEvent) {
        match event {
            ShapeEvent::Batch {
                shape,
                generation,
                batch,
                applied,
            } => {
                let keep_going = self.apply_batch(&shape, generation, batch);
                let _ = applied.send(keep_going);
            }
            ShapeEvent::Failed {
                shape,
                generation,
                error,
            } => {
                if self.is_current(&shape, generation) {
                    self.fail_shape(&shape, Error::Transport(error));
                }
            }
            ShapeEvent::Retrying {
                shape,
                generation,
                error,
                attempt,
                delay,
            } => {
                if let Some(sub) = self.current_mut(&shape, generation) {
                    tracing::warn!(
                        shape = %shape,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        transient = error.is_transient(),
                        error = %error,
                        "shape fetch failed, retrying"
                    );
                    sub.last_error = Some(error.to_string());
                }
            }
        }
    }

    fn is_current(&self, name: &str, generation: u64) -> bool {
        self.shapes
            .get(name)
            .is_some_and(|s| s.generation == generation && s.state.is_active())
    }

    fn current_mut(&mut self, name: &str, generation: u64) -> Option<&mut ShapeSubscription> {
        self.shapes
            .get_mut(name)
            .filter(|s| s.generation == generation && s.state.is_active())
    }

    fn fail_shape(&mut self, name: &str, error: Error) {
        let Some(sub) = self.shapes.get_mut(name) else {
            return;
        };
        tracing::error!(shape = %name, error = %error, "shape failed");
        sub.cancel();
        sub.state = ShapeState::Failed;
        sub.last_error = Some(error.to_string());
        if let Some(reply) = sub.pending_reply.take() {
            self.respond(reply.port, ResponseEnvelope::error(reply.id, &error));
        }
    }

    /// Apply one batch. Returns whether the fetch loop should continue.
    fn apply_batch(&mut self, name: &str, generation: u64, batch: ShapeBatch) -> bool {
        if !self.phase.is_ready() || !self.is_current(name, generation) {
            return false;
        }
        match self.write_batch(name, batch) {
            Ok((broadcasts, reply)) => {
                for msg in broadcasts {
                    self.broadcast(msg);
                }
                if let Some((reply, ack)) = reply {
                    self.respond(
                        reply.port,
                        ResponseEnvelope {
                            id: reply.id,
                            body: ResponseBody::SyncShapeResult { result: ack },
                        },
                    );
                }
                true
            }
            Err(e) => {
                self.fail_shape(name, e);
                false
            }
        }
    }

    /// Write a batch into the shape's table and, at up-to-date points,
    /// diff the table against the shape's baseline.
    fn write_batch(&mut self, name: &str, batch: ShapeBatch) -> Result<BatchOutcome> {
        let conn = self.store.connection();
        let sub = self
            .shapes
            .get_mut(name)
            .ok_or_else(|| Error::protocol(format!("unknown shape {name}")))?;
        let table = sub.definition.table_name.clone();
        let mut out = Vec::new();

        if !sqlite::table_exists(conn, &table)? {
            if !batch.schema.is_empty() {
                sqlite::create_table_from_schema(conn, &table, &batch.schema)?;
                tracing::debug!(table = %table, "created table from remote schema");
            } else if !batch.must_refetch {
                return Err(Error::TableMissing(table));
            }
        }

        advance_token(&mut sub.token, &batch);

        if batch.must_refetch {
            // Rows are re-fetched from scratch; the baseline stays so the next
            // up-to-date point reports the net change.
            if sqlite::table_exists(conn, &table)? {
                sqlite::clear_table(conn, &table)?;
            }
            sub.state = ShapeState::Syncing;
            tracing::info!(shape = %name, "server requested refetch");
            return Ok((out, None));
        }

        tracing::debug!(shape = %name, rows = batch.len(), up_to_date = batch.up_to_date, "applying batch");
        // The first batch of a run starts from the initial offset, so the
        // server resends every row; anything left locally is stale.
        let fresh = std::mem::take(&mut sub.stale_rows);
        match &batch.payload {
            BatchPayload::Snapshot(rows) => sqlite::replace_rows(conn, &table, rows)?,
            BatchPayload::Changes(changes) if fresh => {
                sqlite::replace_with_changes(conn, &table, changes)?;
                tracing::debug!(shape = %name, "cleared rows left by an earlier run");
            }
            BatchPayload::Changes(changes) => sqlite::apply_changes(conn, &table, changes)?,
        }

        if !batch.up_to_date {
            sub.state = ShapeState::Syncing;
            return Ok((out, None));
        }

        let changes = sub.snapshot.reconcile(sqlite::keyed_rows(conn, &table)?);
        if !changes.is_empty() {
            out.push(Broadcast::DataChange {
                shape_name: name.to_string(),
                table_name: table.clone(),
                changes,
            });
        }
        sub.state = ShapeState::Synced;
        sub.last_error = None;

        let mut reply = None;
        if !sub.synced_once {
            sub.synced_once = true;
            let record_count = sqlite::count_rows(conn, &table)?;
            tracing::info!(shape = %name, record_count, "shape synced");
            out.push(Broadcast::ShapeSynced {
                shape_name: name.to_string(),
                record_count,
            });
            reply = sub.pending_reply.take().map(|r| {
                (
                    r,
                    ShapeAck {
                        shape_name: name.to_string(),
                        record_count: Some(record_count),
                        already_active: false,
                    },
                )
            });
        }
        Ok((out, reply))
    }

    /// Diff every synced shape against its table, so direct writes reach
    /// listeners.
    fn refresh_synced_shapes(&mut self) {
        let conn = self.store.connection();
        let mut out = Vec::new();
        for (name, sub) in self.shapes.iter_mut() {
            if sub.state != ShapeState::Synced {
                continue;
            }
            let table = &sub.definition.table_name;
            let rows = match sqlite::table_exists(conn, table) {
                Ok(true) => sqlite::keyed_rows(conn, table),
                Ok(false) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
            match rows {
                Ok(rows) => {
                    let changes = sub.snapshot.reconcile(rows);
                    if !changes.is_empty() {
                        out.push(Broadcast::DataChange {
                            shape_name: name.clone(),
                            table_name: table.clone(),
                            changes,
                        });
                    }
                }
                Err(e) => tracing::warn!(shape = %name, error = %e, "could not re-read table"),
            }
        }
        for msg in out {
            self.broadcast(msg);
        }
    }

    // ========================================================================
    // Direct database access
    // ========================================================================

    fn query(&self, sql: &str, params: &[serde_json::Value]) -> Result<Vec<Row>> {
        self.require_ready()?;
        sqlite::query(self.store.connection(), sql, params)
    }

    fn exec(&mut self, sql: &str) -> Result<ExecResult> {
        self.require_ready()?;
        let changes = sqlite::exec(self.store.connection(), sql)?;
        self.refresh_synced_shapes();
        Ok(ExecResult { changes })
    }

    // ========================================================================
    // Status and delivery
    // ========================================================================

    fn status(&self) -> EngineStatus {
        EngineStatus {
            is_ready: self.phase.is_ready(),
            is_initializing: matches!(
                self.phase,
                SchemaPhase::Checking | SchemaPhase::Matched | SchemaPhase::Reset
            ),
            error: self.error.clone(),
            connected_tab_count: self.ports.len(),
            active_shape_names: self
                .shapes
                .values()
                .filter(|s| s.state.is_active())
                .map(|s| s.name().to_string())
                .collect(),
            schema_version: self.schema_version.clone(),
            storage: Some(self.store.strategy()),
            shapes: self.shapes.values().map(ShapeSubscription::status).collect(),
        }
    }

    fn respond(&mut self, port: PortId, envelope: ResponseEnvelope) {
        let Some(outbox) = self.ports.get(&port) else {
            tracing::trace!(port, id = envelope.id, "response for a closed port dropped");
            return;
        };
        if outbox.send(WorkerMessage::Response(envelope)).is_err() {
            self.ports.remove(&port);
        }
    }

    /// Send to every connected port, pruning ports that have gone away.
    fn broadcast(&mut self, msg: Broadcast) {
        let before = self.ports.len();
        self.ports
            .retain(|_, outbox| outbox.send(WorkerMessage::Broadcast(msg.clone())).is_ok());
        if self.ports.len() != before {
            tracing::debug!(pruned = before - self.ports.len(), "pruned closed ports");
        }
    }
}
