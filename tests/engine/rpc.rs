//! Request/response correlation, timeouts, and fan-out across clients.

use std::time::Duration;

use less_shapes::{ChangeEvent, EngineStatus, Error, ShapeBatch, ShapeDefinition};
use serde_json::json;
use tokio::sync::mpsc;

use crate::support::{eventually, next, rows, Harness, WORKSPACES_DDL, WORKSPACES_URL};

fn workspaces() -> ShapeDefinition {
    ShapeDefinition::new("workspaces", "workspaces", WORKSPACES_URL).with_schema(WORKSPACES_DDL)
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_requests_are_forgotten() {
    let h = Harness::new();
    let client = h.client_with(h.config().with_request_timeout(Duration::from_millis(200)));
    client.init().await.unwrap();

    // The server has nothing queued, so the first sync never completes in time.
    let err = client.sync_shape(workspaces()).await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");

    // The late reply is dropped without disturbing later calls.
    h.transport.push(
        WORKSPACES_URL,
        ShapeBatch::snapshot(rows(&[json!({"id": 1, "name": "A"})])).with_token("0_1", "h1"),
    );
    eventually(|| client.status().active_shape_names == ["workspaces"]).await;
    assert!(client.ping().await.unwrap().pong);

    let again = client.sync_shape(workspaces()).await.unwrap();
    assert!(again.already_active);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_get_their_own_responses() {
    let h = Harness::new();
    let client = h.client();
    client.init().await.unwrap();
    client.exec(WORKSPACES_DDL).await.unwrap();
    client
        .exec("INSERT INTO workspaces (id, name) VALUES (1, 'a'), (2, 'b'), (3, 'c')")
        .await
        .unwrap();

    let sql = "SELECT name FROM workspaces WHERE id = ?1";
    let (p1, p2, p3) = ([json!(1)], [json!(2)], [json!(3)]);
    let (one, two, three, pong) = tokio::join!(
        client.query(sql, &p1),
        client.query(sql, &p2),
        client.query(sql, &p3),
        client.ping(),
    );
    assert_eq!(one.unwrap(), rows(&[json!({"name": "a"})]));
    assert_eq!(two.unwrap(), rows(&[json!({"name": "b"})]));
    assert_eq!(three.unwrap(), rows(&[json!({"name": "c"})]));
    assert!(pong.unwrap().timestamp_ms > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn query_binds_json_parameters() {
    let h = Harness::new();
    let client = h.client();
    client.init().await.unwrap();
    client
        .exec(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, score REAL, archived INTEGER);
             INSERT INTO notes VALUES (1, 'hello', 1.5, 0), (2, NULL, 2.5, 1);",
        )
        .await
        .unwrap();

    let found = client
        .query(
            "SELECT id, body, score FROM notes WHERE score > ?1 AND archived = ?2",
            &[json!(2.0), json!(true)],
        )
        .await
        .unwrap();
    assert_eq!(found, rows(&[json!({"id": 2, "body": null, "score": 2.5})]));

    let none = client
        .query("SELECT id FROM notes WHERE body = ?1", &[json!("missing")])
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn sql_errors_come_back_verbatim() {
    let h = Harness::new();
    let client = h.client();
    client.init().await.unwrap();

    let err = client.exec("SELEC 1").await.unwrap_err();
    match &err {
        Error::Remote(message) => assert!(message.contains("syntax error"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }

    let err = client.query("SELECT * FROM nowhere", &[]).await.unwrap_err();
    assert!(err.to_string().contains("no such table: nowhere"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_on_one_core_share_events_and_status() {
    let h = Harness::new();
    let a = h.client();
    let b = h.client();
    a.init().await.unwrap();
    b.connect().await.unwrap();

    let (tx, mut events) = mpsc::unbounded_channel::<ChangeEvent>();
    let _unsub = b.on_data_change("workspaces", move |e| {
        let _ = tx.send(e.clone());
    });

    let status = b.get_status().await.unwrap();
    assert_eq!(status.connected_tab_count, 2);
    assert!(status.is_ready);

    h.transport.push(
        WORKSPACES_URL,
        ShapeBatch::snapshot(rows(&[json!({"id": 1, "name": "A"})])).with_token("0_1", "h1"),
    );
    a.sync_shape(workspaces()).await.unwrap();
    let synced = next(&mut events).await;
    assert_eq!(synced.changes.insert, rows(&[json!({"id": 1, "name": "A"})]));

    // A direct write from one client reaches the other's listeners.
    a.exec("UPDATE workspaces SET name = 'local' WHERE id = 1")
        .await
        .unwrap();
    let updated = next(&mut events).await;
    assert_eq!(updated.changes.update[0].old["name"], "A");
    assert_eq!(updated.changes.update[0].new["name"], "local");

    // B's mirror tracks A leaving.
    a.disconnect();
    eventually(|| b.status().connected_tab_count == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn status_listeners_see_readiness() {
    let h = Harness::new();
    let client = h.client();
    let (tx, mut statuses) = mpsc::unbounded_channel::<EngineStatus>();
    let _unsub = client.on_status_change(move |s| {
        let _ = tx.send(s.clone());
    });

    client.init().await.unwrap();
    loop {
        let status = next(&mut statuses).await;
        if status.is_ready {
            assert_eq!(status.schema_version.as_deref(), Some("v1"));
            assert_eq!(status.connected_tab_count, 1);
            break;
        }
    }
}
