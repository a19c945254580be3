//! Stopping, restarting and the boundary between them.

use std::sync::Arc;
use std::time::Duration;

use datasync_engine::{DataStore, EngineState, SyncError};
use datasync_model::MutationType;
use datasync_testkit::prelude::*;

#[tokio::test]
async fn changes_after_stop_are_not_applied() {
    init_tracing();
    let harness = SyncHarness::new();
    harness.start().await;
    let mut changes = harness.datastore.observe();
    let posts = schema(&harness.registry, "Post");

    harness.backend.remote_save(&post(&harness.registry, "p1", "before"));
    let applied = changes.recv().await.unwrap();
    assert_eq!(applied.model_id, "p1");

    harness.datastore.stop().await;
    assert_eq!(harness.state(), EngineState::Stopped);
    assert_eq!(harness.backend.subscription_count(), 0);

    harness.backend.remote_save(&post(&harness.registry, "p2", "after"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(changes.try_recv().is_none());
    assert!(harness.datastore.query_by_id(&posts, "p1").unwrap().is_some());
    assert!(harness.datastore.query_by_id(&posts, "p2").unwrap().is_none());
}

#[tokio::test]
async fn store_is_quiet_once_stop_returns() {
    let harness = SyncHarness::new();
    harness.start().await;
    for i in 0..20 {
        harness
            .backend
            .remote_save(&post(&harness.registry, &format!("p{i}"), "burst"));
    }
    harness.datastore.stop().await;

    let settled = harness.datastore.local_store().count("Post");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.datastore.local_store().count("Post"), settled);
}

#[tokio::test]
async fn writes_while_stopped_are_sent_after_restart() {
    let harness = SyncHarness::new();
    harness.start().await;
    harness.datastore.stop().await;

    harness
        .datastore
        .save(&post(&harness.registry, "p1", "offline"), None)
        .unwrap();
    assert_eq!(harness.datastore.outbox().len(), 1);
    assert!(harness.backend.mutations().is_empty());

    harness.start().await;
    assert!(harness.drained().await);
    assert_eq!(harness.backend.record("Post", "p1").unwrap().version, 1);
}

#[tokio::test]
async fn in_flight_entries_are_resubmitted_on_start() {
    let harness = SyncHarness::new();
    harness
        .datastore
        .save(&post(&harness.registry, "p1", "interrupted"), None)
        .unwrap();
    let taken = harness.datastore.outbox().next_ready().unwrap().unwrap();
    assert_eq!(taken.event.mutation_type, MutationType::Create);
    assert!(harness.datastore.outbox().pending()[0].in_flight);

    harness.start().await;
    assert!(harness.drained().await);
    assert!(harness.backend.record("Post", "p1").is_some());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let harness = SyncHarness::new();
    harness.start().await;
    let second = harness.datastore.start();
    assert!(matches!(second, Err(SyncError::InvalidStateTransition { .. })));
    assert_eq!(harness.state(), EngineState::Syncing);

    harness.datastore.stop().await;
    harness.datastore.stop().await;
    assert_eq!(harness.state(), EngineState::Stopped);
}

#[tokio::test]
async fn queued_writes_survive_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryAppSync::new(blog_registry()));
    let open = || {
        DataStore::builder(blog_registry())
            .directory(dir.path())
            .sync_config(fast_sync_config())
            .transport(backend.clone())
            .build()
            .unwrap()
    };

    let first = open();
    first
        .save(&post(first.registry(), "p1", "durable"), None)
        .unwrap();
    drop(first);

    let reopened = open();
    assert_eq!(reopened.outbox().len(), 1);
    reopened.start_and_wait().await.unwrap();
    assert!(eventually(|| reopened.outbox().is_empty()).await);
    assert_eq!(backend.record("Post", "p1").unwrap().data["title"], "durable");
    reopened.stop().await;
}
