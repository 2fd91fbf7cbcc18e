//! init, forceReset, readiness gating, and capability fallbacks.

use std::time::Duration;

use less_shapes::{
    Capabilities, ContextRegistry, ContextStrategy, InitOutcome, SchemaResetReason,
    ShapeBatch, ShapeDefinition, StorageStrategy, TransportError,
};
use serde_json::json;
use tokio::sync::mpsc;

use crate::support::{eventually, next, rows, Harness, WORKSPACES_DDL, WORKSPACES_URL};

async fn seed_workspace(client: &less_shapes::SyncClient) {
    client.exec(WORKSPACES_DDL).await.unwrap();
    client
        .exec("INSERT INTO workspaces (id, name) VALUES (1, 'local')")
        .await
        .unwrap();
}

// ============================================================================
// init
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn first_init_creates_and_later_inits_match() {
    let h = Harness::new();
    let client = h.client();

    let first = client.init().await.unwrap();
    assert!(first.success);
    assert_eq!(first.outcome, InitOutcome::FirstRun);
    assert_eq!(first.schema_version, "v1");
    seed_workspace(&client).await;

    let second = client.init().await.unwrap();
    assert_eq!(second.outcome, InitOutcome::Matched);
    let rows = client.query("SELECT name FROM workspaces", &[]).await.unwrap();
    assert_eq!(rows[0]["name"], "local");

    let status = client.get_status().await.unwrap();
    assert!(status.is_ready);
    assert!(!status.is_initializing);
    assert_eq!(status.schema_version.as_deref(), Some("v1"));
    assert_eq!(status.storage, Some(StorageStrategy::FileBacked));
}

#[tokio::test(flavor = "multi_thread")]
async fn persisted_version_survives_a_new_core() {
    let h = Harness::new();
    let client = h.client();
    client.init().await.unwrap();
    seed_workspace(&client).await;

    // A second registry opens the same database file from a fresh core.
    let registry = ContextRegistry::new();
    let mut host = h.host();
    host.registry = registry.clone();
    let reopened = less_shapes::SyncClient::with_host(h.config(), host).unwrap();

    let result = reopened.init().await.unwrap();
    assert_eq!(result.outcome, InitOutcome::Matched);
    let rows = reopened
        .query("SELECT id FROM workspaces WHERE name = ?1", &[json!("local")])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    registry.shutdown_all();
}

#[tokio::test(flavor = "multi_thread")]
async fn init_proceeds_offline_with_a_persisted_version() {
    let h = Harness::new();
    let client = h.client();
    client.init().await.unwrap();
    seed_workspace(&client).await;

    h.transport.fail_version(TransportError::new("network unreachable"));
    let result = client.init().await.unwrap();
    assert_eq!(result.outcome, InitOutcome::Matched);
    assert_eq!(result.schema_version, "v1");

    let rows = client.query("SELECT * FROM workspaces", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn init_fails_without_server_or_persisted_version() {
    let h = Harness::new();
    let client = h.client();
    h.transport.fail_version(TransportError::new("network unreachable"));

    let err = client.init().await.unwrap_err();
    assert!(err.to_string().contains("network unreachable"), "{err}");

    let mirrored = client.status();
    assert!(!mirrored.is_ready);
    assert!(mirrored.error.unwrap().contains("network unreachable"));

    // A later init against a reachable server recovers.
    h.transport.set_version("v1");
    assert_eq!(client.init().await.unwrap().outcome, InitOutcome::FirstRun);
    assert!(client.status().is_ready);
    assert_eq!(client.status().error, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_reinit_stops_running_shapes() {
    let h = Harness::new();
    let client = h.client();
    let (tx, mut events) = mpsc::unbounded_channel();
    let _unsub = client.on_data_change("workspaces", move |e| {
        let _ = tx.send(e.clone());
    });
    client.init().await.unwrap();
    h.transport.push(
        WORKSPACES_URL,
        ShapeBatch::snapshot(rows(&[json!({"id": 1, "name": "A"})])).with_token("0_1", "h1"),
    );
    client
        .sync_shape(
            ShapeDefinition::new("workspaces", "workspaces", WORKSPACES_URL)
                .with_schema(WORKSPACES_DDL),
        )
        .await
        .unwrap();
    next(&mut events).await;

    // Lose the persisted version, then re-run init while the server is down.
    client.exec("DELETE FROM _less_shapes_meta").await.unwrap();
    h.transport.fail_version(TransportError::new("network unreachable"));
    client.init().await.unwrap_err();

    let status = client.get_status().await.unwrap();
    assert!(!status.is_ready);
    assert!(status.active_shape_names.is_empty());

    // A batch the server sends now is never written or announced.
    h.transport.push(
        WORKSPACES_URL,
        ShapeBatch::snapshot(rows(&[json!({"id": 2, "name": "B"})])).with_token("0_2", "h1"),
    );
    let late = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(late.is_err(), "unexpected change event: {late:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn database_calls_before_init_are_rejected() {
    let h = Harness::new();
    let client = h.client();

    let err = client.query("SELECT 1", &[]).await.unwrap_err();
    assert!(err.to_string().contains("not ready"), "{err}");
    let err = client.exec("CREATE TABLE t (id INTEGER)").await.unwrap_err();
    assert!(err.to_string().contains("not ready"), "{err}");

    // Status and ping do not need a ready database.
    assert!(!client.get_status().await.unwrap().is_ready);
    assert!(client.ping().await.unwrap().pong);
}

// ============================================================================
// forceReset
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn force_reset_wipes_data_and_stays_ready() {
    let h = Harness::new();
    let client = h.client();
    let (tx, mut resets) = mpsc::unbounded_channel();
    let _unsub = client.on_schema_reset(move |e| {
        let _ = tx.send(e.clone());
    });
    client.init().await.unwrap();
    seed_workspace(&client).await;

    let ack = client.force_reset().await.unwrap();
    assert_eq!(ack.schema_version.as_deref(), Some("v1"));

    let reset = next(&mut resets).await;
    assert_eq!(reset.reason, SchemaResetReason::ForceReset);
    assert_eq!(reset.old_version.as_deref(), Some("v1"));
    assert_eq!(reset.new_version.as_deref(), Some("v1"));

    let err = client.query("SELECT * FROM workspaces", &[]).await.unwrap_err();
    assert!(err.to_string().contains("no such table"), "{err}");
    assert!(client.get_status().await.unwrap().is_ready);

    // The version was kept, so the next init matches instead of resetting.
    assert_eq!(client.init().await.unwrap().outcome, InitOutcome::Matched);
}

#[tokio::test(flavor = "multi_thread")]
async fn force_reset_before_init_leaves_the_engine_uninitialized() {
    let h = Harness::new();
    let client = h.client();

    let ack = client.force_reset().await.unwrap();
    assert_eq!(ack.schema_version, None);
    assert!(!client.get_status().await.unwrap().is_ready);

    assert_eq!(client.init().await.unwrap().outcome, InitOutcome::FirstRun);
}

// ============================================================================
// Capability fallbacks
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn shared_file_backed_when_the_environment_allows() {
    let h = Harness::new();
    let client = h.client();
    assert_eq!(client.capabilities(), None);
    client.connect().await.unwrap();
    assert_eq!(
        client.capabilities(),
        Some(Capabilities {
            context_strategy: ContextStrategy::Shared,
            storage_strategy: StorageStrategy::FileBacked,
        })
    );
    assert!(h.registry.get("test-db").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn isolated_environments_get_a_private_key_value_core() {
    let h = Harness::isolated();
    let a = h.client();
    let b = h.client();

    a.init().await.unwrap();
    assert_eq!(
        a.capabilities(),
        Some(Capabilities {
            context_strategy: ContextStrategy::PerTab,
            storage_strategy: StorageStrategy::KeyValueBacked,
        })
    );
    assert!(h.registry.get("test-db").is_none());
    seed_workspace(&a).await;

    // Metadata is shared through the key-value store; rows are not.
    assert_eq!(b.init().await.unwrap().outcome, InitOutcome::Matched);
    let err = b.query("SELECT * FROM workspaces", &[]).await.unwrap_err();
    assert!(err.to_string().contains("no such table"), "{err}");

    for client in [&a, &b] {
        let status = client.get_status().await.unwrap();
        assert_eq!(status.connected_tab_count, 1);
        assert_eq!(status.storage, Some(StorageStrategy::KeyValueBacked));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn private_file_backed_cores_do_not_share_a_database() {
    let h = Harness::per_tab_files();
    let a = h.client();
    let b = h.client();
    a.init().await.unwrap();
    b.init().await.unwrap();
    assert_eq!(
        a.capabilities(),
        Some(Capabilities {
            context_strategy: ContextStrategy::PerTab,
            storage_strategy: StorageStrategy::FileBacked,
        })
    );
    seed_workspace(&a).await;

    let err = b.query("SELECT * FROM workspaces", &[]).await.unwrap_err();
    assert!(err.to_string().contains("no such table"), "{err}");

    // A reset in one client leaves the other's database alone.
    b.force_reset().await.unwrap();
    a.exec("INSERT INTO workspaces (id, name) VALUES (2, 'after-reset')")
        .await
        .unwrap();
    let found = a.query("SELECT id FROM workspaces ORDER BY id", &[]).await.unwrap();
    assert_eq!(found, rows(&[json!({"id": 1}), json!({"id": 2})]));
    assert!(!h.data_dir().join("test-db.sqlite3").exists());

    // Private databases go away with their clients.
    drop(a);
    drop(b);
    eventually(|| {
        std::fs::read_dir(h.data_dir())
            .map(|entries| entries.count() == 0)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_fails_later_calls() {
    let h = Harness::isolated();
    let client = h.client();
    client.init().await.unwrap();
    client.disconnect();
    let err = client.ping().await.unwrap_err();
    assert!(
        matches!(err, less_shapes::Error::Disconnected),
        "unexpected error: {err}"
    );
}
