//! Shape subscriptions and their fetch loops.
//!
//! A fetch loop owns the network side of one subscription: it issues
//! requests, hands each batch to the core and waits until the core has
//! applied it before asking for the next one. The core owns everything
//! else (state, diff baseline, table writes).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::backoff::Backoff;
use crate::diff::LocalSnapshot;
use crate::transport::{ShapeBatch, ShapeRequest, ShapeTransport, TransportError};
use crate::types::{ContinuationToken, ShapeDefinition, ShapeState, ShapeStatus};

/// A request id waiting on the outcome of a subscription's first sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingReply {
    pub port: u64,
    pub id: u64,
}

pub(crate) struct ShapeSubscription {
    pub definition: ShapeDefinition,
    pub state: ShapeState,
    /// Distinguishes this run from earlier runs under the same name, so
    /// events from a cancelled loop are ignored.
    pub generation: u64,
    pub token: ContinuationToken,
    pub snapshot: LocalSnapshot,
    /// Set once the first up-to-date point has been applied.
    pub synced_once: bool,
    /// The table may hold rows from an earlier run. They are cleared when the
    /// first batch from the initial offset arrives.
    pub stale_rows: bool,
    pub pending_reply: Option<PendingReply>,
    pub task: Option<JoinHandle<()>>,
    pub last_error: Option<String>,
}

impl ShapeSubscription {
    pub fn new(definition: ShapeDefinition, generation: u64) -> Self {
        Self {
            definition,
            state: ShapeState::Pending,
            generation,
            token: ContinuationToken::initial(),
            snapshot: LocalSnapshot::new(),
            synced_once: false,
            stale_rows: true,
            pending_reply: None,
            task: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.shape_name
    }

    /// Abort the fetch loop, if any. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn status(&self) -> ShapeStatus {
        ShapeStatus {
            shape_name: self.definition.shape_name.clone(),
            table_name: self.definition.table_name.clone(),
            state: self.state,
            offset: (!self.token.is_initial()).then(|| self.token.offset.clone()),
            last_error: self.last_error.clone(),
        }
    }
}

impl Drop for ShapeSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Advance `token` past `batch`. A must-refetch restarts from the initial
/// offset under the handle the server just issued.
pub(crate) fn advance_token(token: &mut ContinuationToken, batch: &ShapeBatch) {
    if batch.must_refetch {
        *token = ContinuationToken::initial();
        token.handle = batch.handle.clone();
    } else {
        token.advance(batch.offset.as_deref(), batch.handle.as_deref());
    }
}

/// Sent by fetch loops to the core.
pub(crate) enum ShapeEvent {
    /// A batch to apply. The core answers on `applied`: `true` to continue,
    /// `false` to stop the loop.
    Batch {
        shape: String,
        generation: u64,
        batch: ShapeBatch,
        applied: oneshot::Sender<bool>,
    },
    /// A fetch failed before the first up-to-date point. The loop has ended.
    Failed {
        shape: String,
        generation: u64,
        error: TransportError,
    },
    /// A fetch failed after the first up-to-date point and will be retried.
    Retrying {
        shape: String,
        generation: u64,
        error: TransportError,
        attempt: u32,
        delay: Duration,
    },
}

pub(crate) struct FetchLoop {
    pub shape: String,
    pub generation: u64,
    pub url: String,
    pub table: String,
    pub live: bool,
    pub transport: Arc<dyn ShapeTransport>,
    pub events: mpsc::UnboundedSender<ShapeEvent>,
    pub backoff: Backoff,
}

impl FetchLoop {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut token = ContinuationToken::initial();
        // Live long-polling only starts once the initial snapshot is in.
        let mut caught_up = false;
        let mut synced_once = false;
        let mut attempt: u32 = 0;

        loop {
            let request = ShapeRequest {
                url: self.url.clone(),
                table: self.table.clone(),
                token: token.clone(),
                live: self.live && caught_up,
            };
            match self.transport.fetch_shape(&request).await {
                Ok(batch) => {
                    attempt = 0;
                    let up_to_date = batch.up_to_date && !batch.must_refetch;
                    let must_refetch = batch.must_refetch;
                    advance_token(&mut token, &batch);

                    let (applied, ack) = oneshot::channel();
                    let event = ShapeEvent::Batch {
                        shape: self.shape.clone(),
                        generation: self.generation,
                        batch,
                        applied,
                    };
                    if self.events.send(event).is_err() {
                        return;
                    }
                    if !matches!(ack.await, Ok(true)) {
                        return;
                    }

                    if must_refetch {
                        caught_up = false;
                    } else if up_to_date {
                        caught_up = true;
                        synced_once = true;
                        if !self.live {
                            tracing::debug!(shape = %self.shape, "one-shot shape complete");
                            return;
                        }
                    }
                }
                Err(error) if !synced_once => {
                    let _ = self.events.send(ShapeEvent::Failed {
                        shape: self.shape.clone(),
                        generation: self.generation,
                        error,
                    });
                    return;
                }
                Err(error) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.delay(attempt);
                    let event = ShapeEvent::Retrying {
                        shape: self.shape.clone(),
                        generation: self.generation,
                        error,
                        attempt,
                        delay,
                    };
                    if self.events.send(event).is_err() {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
