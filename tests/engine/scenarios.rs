//! The three reference scenarios: live diffing, schema mismatch, and
//! stop-then-restart.

use less_shapes::{
    adapter::ExecutionAdapter, Broadcast, ChangeEvent, ContextStrategy, CoreParams, Request,
    RequestEnvelope, ResponseBody, ResponseEnvelope, RowUpdate, SchemaResetReason, ShapeBatch,
    ShapeDefinition, ShapeState, StorageStrategy, WorkerMessage,
};
use serde_json::json;
use tokio::sync::mpsc;

use crate::support::{next, row, rows, Harness, WORKSPACES_DDL, WORKSPACES_URL};

fn workspaces() -> ShapeDefinition {
    ShapeDefinition::new("workspaces", "workspaces", WORKSPACES_URL).with_schema(WORKSPACES_DDL)
}

// ============================================================================
// Scenario A: snapshot diffing across live updates
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn scenario_a_live_updates_are_diffed_against_the_last_snapshot() {
    let h = Harness::new();
    let client = h.client();
    let (tx, mut events) = mpsc::unbounded_channel::<ChangeEvent>();
    let _unsub = client.on_data_change("workspaces", move |e| {
        let _ = tx.send(e.clone());
    });

    client.init().await.unwrap();
    h.transport.push(
        WORKSPACES_URL,
        ShapeBatch::snapshot(rows(&[json!({"id": 1, "name": "A"})])).with_token("0_1", "h1"),
    );
    let ack = client.sync_shape(workspaces()).await.unwrap();
    assert_eq!(ack.record_count, Some(1));
    assert!(!ack.already_active);

    let first = next(&mut events).await;
    assert_eq!(first.table_name, "workspaces");
    assert_eq!(first.changes.insert, rows(&[json!({"id": 1, "name": "A"})]));
    assert!(first.changes.update.is_empty());
    assert!(first.changes.delete.is_empty());

    h.transport.push(
        WORKSPACES_URL,
        ShapeBatch::snapshot(rows(&[
            json!({"id": 1, "name": "B"}),
            json!({"id": 2, "name": "C"}),
        ]))
        .with_token("0_2", "h1"),
    );
    let second = next(&mut events).await;
    assert_eq!(
        second.changes.update,
        vec![RowUpdate {
            old: row(json!({"id": 1, "name": "A"})),
            new: row(json!({"id": 1, "name": "B"})),
        }]
    );
    assert_eq!(second.changes.insert, rows(&[json!({"id": 2, "name": "C"})]));
    assert!(second.changes.delete.is_empty());

    // The follow-up request carried the token and asked for a long-poll.
    let requests = h.transport.requests_for(WORKSPACES_URL);
    assert!(!requests[0].live);
    assert!(requests[0].token.is_initial());
    assert!(requests[1].live);
    assert_eq!(requests[1].token.offset, "0_1");
    assert_eq!(requests[1].token.handle.as_deref(), Some("h1"));
}

// ============================================================================
// Scenario B: schema mismatch resets before readiness
// ============================================================================

async fn collect_until_response(
    rx: &mut mpsc::UnboundedReceiver<WorkerMessage>,
    id: u64,
) -> (Vec<Broadcast>, ResponseEnvelope) {
    let mut broadcasts = Vec::new();
    loop {
        match next(rx).await {
            WorkerMessage::Broadcast(b) => broadcasts.push(b),
            WorkerMessage::Response(r) if r.id == id => return (broadcasts, r),
            WorkerMessage::Response(r) => panic!("unexpected response {r:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_b_version_mismatch_broadcasts_one_reset_before_ready() {
    let h = Harness::new();
    let config = h
        .config()
        .with_data_dir(h.environment.data_dir.clone().unwrap());
    let adapter = ExecutionAdapter::open(
        ContextStrategy::Shared,
        &h.registry,
        CoreParams {
            config,
            storage: StorageStrategy::FileBacked,
            transport: h.transport.clone(),
            key_value: h.key_value.clone(),
        },
    )
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.on_message(move |msg| {
        let _ = tx.send(msg);
    });

    adapter
        .send(RequestEnvelope {
            id: 1,
            request: Request::Init,
        })
        .unwrap();
    let (_, first) = collect_until_response(&mut rx, 1).await;
    assert!(matches!(first.body, ResponseBody::InitResult { .. }));

    h.transport.set_version("v2");
    adapter
        .send(RequestEnvelope {
            id: 2,
            request: Request::Init,
        })
        .unwrap();
    let (broadcasts, response) = collect_until_response(&mut rx, 2).await;

    assert_eq!(
        broadcasts,
        vec![
            Broadcast::SchemaReset {
                reason: SchemaResetReason::VersionMismatch,
                old_version: Some("v1".into()),
                new_version: Some("v2".into()),
            },
            Broadcast::DbReady {
                schema_version: "v2".into(),
            },
        ]
    );
    match response.body {
        ResponseBody::InitResult { result } => {
            assert!(result.success);
            assert_eq!(result.schema_version, "v2");
            assert_eq!(result.outcome, less_shapes::InitOutcome::Reset);
        }
        other => panic!("unexpected body {other:?}"),
    }
    adapter.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_b_mismatch_drops_local_data_and_notifies_listeners() {
    let h = Harness::new();
    let client = h.client();
    let (tx, mut resets) = mpsc::unbounded_channel();
    let _unsub = client.on_schema_reset(move |e| {
        let _ = tx.send(e.clone());
    });

    client.init().await.unwrap();
    client.exec(WORKSPACES_DDL).await.unwrap();
    client
        .exec("INSERT INTO workspaces (id, name) VALUES (1, 'local')")
        .await
        .unwrap();

    h.transport.set_version("v2");
    client.init().await.unwrap();

    let reset = next(&mut resets).await;
    assert_eq!(reset.reason, SchemaResetReason::VersionMismatch);
    assert_eq!(reset.old_version.as_deref(), Some("v1"));
    assert_eq!(reset.new_version.as_deref(), Some("v2"));

    let err = client.query("SELECT * FROM workspaces", &[]).await.unwrap_err();
    assert!(err.to_string().contains("no such table"), "{err}");
    assert_eq!(client.status().schema_version.as_deref(), Some("v2"));
}

// ============================================================================
// Scenario C: stop then restart
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn scenario_c_stop_then_sync_starts_a_fresh_loop() {
    let h = Harness::new();
    let client = h.client();
    let (tx, mut events) = mpsc::unbounded_channel::<ChangeEvent>();
    let _unsub = client.on_data_change("workspaces", move |e| {
        let _ = tx.send(e.clone());
    });
    client.init().await.unwrap();

    h.transport.push(
        WORKSPACES_URL,
        ShapeBatch::snapshot(rows(&[json!({"id": 1, "name": "A"})])).with_token("0_1", "h1"),
    );
    client.sync_shape(workspaces()).await.unwrap();
    next(&mut events).await;

    client.stop_shape("workspaces").await.unwrap();

    h.transport.push(
        WORKSPACES_URL,
        ShapeBatch::snapshot(rows(&[json!({"id": 1, "name": "A"})])).with_token("0_1", "h1"),
    );
    let ack = client.sync_shape(workspaces()).await.unwrap();
    assert!(!ack.already_active);
    assert_eq!(ack.record_count, Some(1));

    // The restarted shape diffs against an empty baseline.
    let restarted = next(&mut events).await;
    assert_eq!(restarted.changes.insert, rows(&[json!({"id": 1, "name": "A"})]));

    let initial_requests = h
        .transport
        .requests_for(WORKSPACES_URL)
        .into_iter()
        .filter(|r| r.token.is_initial())
        .count();
    assert_eq!(initial_requests, 2);

    let status = client.get_status().await.unwrap();
    let shape = status
        .shapes
        .iter()
        .find(|s| s.shape_name == "workspaces")
        .unwrap();
    assert_eq!(shape.state, ShapeState::Synced);
}
