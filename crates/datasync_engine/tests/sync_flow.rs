//! End-to-end sync tests against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use datasync_engine::{EngineState, HubEvent, SyncConfig, SyncError};
use datasync_model::predicate::field;
use datasync_model::MutationType;
use datasync_testkit::prelude::*;
use serde_json::json;

#[tokio::test]
async fn local_save_reaches_the_backend() {
    init_tracing();
    let harness = SyncHarness::new();
    let p1 = post(&harness.registry, "p1", "hello");

    harness.datastore.save(&p1, None).unwrap();
    let pending = harness.datastore.outbox().pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event.mutation_type, MutationType::Create);
    assert_eq!(pending[0].event.version, None);

    harness.start().await;
    assert!(harness.drained().await);

    let metadata = harness.datastore.local_store().sync_metadata("Post", "p1").unwrap();
    assert_eq!(metadata.version, 1);
    assert!(!metadata.deleted);
    let remote = harness.backend.record("Post", "p1").unwrap();
    assert_eq!(remote.version, 1);
    assert_eq!(remote.data["title"], json!("hello"));

    harness.datastore.stop().await;
}

#[tokio::test]
async fn lifecycle_dispatches_hub_events_in_order() {
    let harness = SyncHarness::new();
    harness.start().await;

    let names = harness.hub.names();
    assert_eq!(
        names,
        vec![
            "syncQueriesStarted",
            "modelSynced",
            "modelSynced",
            "modelSynced",
            "syncQueriesReady",
            "subscriptionsEstablished",
            "networkStatus",
            "ready",
        ]
    );
    match &harness.hub.events()[0] {
        HubEvent::SyncQueriesStarted { models } => {
            let post = models.iter().position(|m| m == "Post").unwrap();
            let comment = models.iter().position(|m| m == "Comment").unwrap();
            assert!(post < comment);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(harness.backend.subscription_count(), 9);

    harness.datastore.stop().await;
    assert_eq!(harness.state(), EngineState::Stopped);
    assert_eq!(harness.backend.subscription_count(), 0);
}

#[tokio::test]
async fn initial_sync_pages_through_the_backend() {
    let harness = SyncHarness::with_config(fast_sync_config().with_sync_page_size(2));
    for i in 0..5 {
        harness.backend.seed(&post(&harness.registry, &format!("p{i}"), "seeded"), 1);
    }
    harness.start().await;

    let posts = schema(&harness.registry, "Post");
    let local = harness.datastore.query(&posts, None, &[], None).unwrap();
    assert_eq!(local.len(), 5);
    let pages = harness
        .backend
        .requests()
        .iter()
        .filter(|r| r.decode_path == "syncPosts")
        .count();
    assert_eq!(pages, 3);
    let cursor = harness.datastore.local_store().sync_state("Post").unwrap();
    assert!(cursor.last_sync.is_some());
    assert_eq!(cursor.next_token, None);

    harness.datastore.stop().await;
}

#[tokio::test]
async fn short_filtered_pages_keep_following_the_token() {
    let config = fast_sync_config()
        .with_sync_page_size(2)
        .with_sync_expression("Post", field("rating").gt(5));
    let harness = SyncHarness::with_config(config);
    for (id, rating) in [("p0", 9), ("p1", 1), ("p2", 1), ("p3", 1), ("p4", 9)] {
        harness.backend.seed(&rated_post(&harness.registry, id, "seeded", rating), 1);
    }
    harness.start().await;

    // [p0] with a token, an empty page with a token, then [p4].
    let pages = harness
        .backend
        .requests()
        .iter()
        .filter(|r| r.decode_path == "syncPosts")
        .count();
    assert_eq!(pages, 3);
    let posts = schema(&harness.registry, "Post");
    assert!(harness.datastore.query_by_id(&posts, "p0").unwrap().is_some());
    assert!(harness.datastore.query_by_id(&posts, "p4").unwrap().is_some());
    assert_eq!(harness.datastore.query(&posts, None, &[], None).unwrap().len(), 2);
    let cursor = harness.datastore.local_store().sync_state("Post").unwrap();
    assert_eq!(cursor.next_token, None);

    harness.datastore.stop().await;
}

#[tokio::test]
async fn restart_runs_a_delta_sync() {
    let harness = SyncHarness::new();
    harness.backend.seed(&post(&harness.registry, "p1", "first"), 1);
    harness.start().await;
    harness.datastore.stop().await;

    harness.backend.remote_save(&post(&harness.registry, "p2", "while stopped"));
    harness.hub.clear();
    harness.start().await;

    let posts = schema(&harness.registry, "Post");
    assert!(harness.datastore.query_by_id(&posts, "p2").unwrap().is_some());
    let synced: Vec<(bool, usize)> = harness
        .hub
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HubEvent::ModelSynced { model, is_full_sync, created, .. } if model == "Post" => {
                Some((is_full_sync, created))
            }
            _ => None,
        })
        .collect();
    assert_eq!(synced, vec![(false, 1)]);

    let delta = harness
        .backend
        .requests()
        .into_iter()
        .filter(|r| r.decode_path == "syncPosts")
        .last()
        .unwrap();
    assert!(delta.variables.contains_key("lastSync"));

    harness.datastore.stop().await;
}

#[tokio::test]
async fn expired_cursor_forces_a_full_sync() {
    let harness = SyncHarness::with_config(fast_sync_config().with_full_sync_interval(Duration::ZERO));
    harness.start().await;
    harness.datastore.stop().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    harness.start().await;
    let last = harness
        .backend
        .requests()
        .into_iter()
        .filter(|r| r.decode_path == "syncPosts")
        .last()
        .unwrap();
    assert!(!last.variables.contains_key("lastSync"));
    assert!(harness.hub.events().iter().all(|e| match e {
        HubEvent::ModelSynced { is_full_sync, .. } => *is_full_sync,
        _ => true,
    }));

    harness.datastore.stop().await;
}

#[tokio::test]
async fn remote_changes_arrive_through_subscriptions() {
    let harness = SyncHarness::new();
    harness.start().await;
    let mut changes = harness.datastore.observe();
    let posts = schema(&harness.registry, "Post");
    let comments = schema(&harness.registry, "Comment");

    harness.backend.remote_save(&post(&harness.registry, "p1", "remote"));
    let created = changes.recv().await.unwrap();
    assert_eq!((created.model_id.as_str(), created.mutation_type), ("p1", MutationType::Create));
    harness.backend.remote_save(&comment(&harness.registry, "c1", "p1", "nice"));
    let created = changes.recv().await.unwrap();
    assert_eq!((created.model_name.as_str(), created.mutation_type), ("Comment", MutationType::Create));

    harness
        .backend
        .remote_save(&post(&harness.registry, "p1", "edited"));
    let updated = changes.recv().await.unwrap();
    assert_eq!(updated.mutation_type, MutationType::Update);
    assert_eq!(updated.version, Some(2));
    let local = harness.datastore.query_by_id(&posts, "p1").unwrap().unwrap();
    assert_eq!(local.get("title").as_str(), Some("edited"));

    harness.backend.remote_delete("Post", "p1");
    let cascaded = changes.recv().await.unwrap();
    assert_eq!((cascaded.model_id.as_str(), cascaded.mutation_type), ("c1", MutationType::Delete));
    let deleted = changes.recv().await.unwrap();
    assert_eq!((deleted.model_id.as_str(), deleted.mutation_type), ("p1", MutationType::Delete));
    assert!(harness.datastore.query_by_id(&posts, "p1").unwrap().is_none());
    assert!(harness.datastore.query_by_id(&comments, "c1").unwrap().is_none());
    let tombstone = harness.datastore.local_store().sync_metadata("Post", "p1").unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.version, 3);
    assert!(harness.hub.count("syncReceived") >= 4);

    harness.datastore.stop().await;
}

#[tokio::test]
async fn cascade_delete_is_queued_for_every_row() {
    let harness = SyncHarness::new();
    harness.start().await;
    let p1 = post(&harness.registry, "p1", "parent");
    harness.datastore.save(&p1, None).unwrap();
    harness
        .datastore
        .save(&comment(&harness.registry, "c1", "p1", "child"), None)
        .unwrap();
    assert!(harness.drained().await);

    let deleted = harness.datastore.delete(&p1, None).unwrap();
    assert_eq!(deleted.len(), 1);
    assert!(harness.drained().await);
    assert!(eventually(|| {
        harness.backend.record("Post", "p1").is_some_and(|r| r.deleted)
            && harness.backend.record("Comment", "c1").is_some_and(|r| r.deleted)
    })
    .await);

    harness.datastore.stop().await;
}

#[tokio::test]
async fn sync_expression_filters_remote_data() {
    let config = fast_sync_config().with_sync_expression("Post", field("rating").gt(5));
    let harness = SyncHarness::with_config(config);
    harness.backend.seed(&rated_post(&harness.registry, "hi", "high", 9), 1);
    harness.backend.seed(&rated_post(&harness.registry, "lo", "low", 1), 1);
    harness.start().await;

    let posts = schema(&harness.registry, "Post");
    assert!(harness.datastore.query_by_id(&posts, "hi").unwrap().is_some());
    assert!(harness.datastore.query_by_id(&posts, "lo").unwrap().is_none());
    let request = harness
        .backend
        .requests()
        .into_iter()
        .find(|r| r.decode_path == "syncPosts")
        .unwrap();
    assert_eq!(request.variables["filter"], json!({"rating": {"gt": 5}}));

    harness
        .backend
        .remote_save(&rated_post(&harness.registry, "lo2", "low again", 2));
    assert!(eventually(|| harness.hub.contains("nonApplicableDataReceived")).await);
    assert!(harness.datastore.query_by_id(&posts, "lo2").unwrap().is_none());

    harness.datastore.stop().await;
}

#[tokio::test]
async fn offline_start_retries_until_the_backend_returns() {
    let harness = SyncHarness::new();
    harness.backend.set_offline(true);
    harness.datastore.start().unwrap();

    assert!(eventually(|| harness.hub.events().iter().any(|e| matches!(
        e,
        HubEvent::NetworkStatus { active: false }
    )))
    .await);
    assert_ne!(harness.state(), EngineState::Syncing);

    harness.backend.set_offline(false);
    let engine = harness.datastore.engine().unwrap();
    let reached = tokio::time::timeout(
        WAIT_TIMEOUT,
        engine.wait_for_state(|s| *s == EngineState::Syncing),
    )
    .await;
    assert!(reached.is_ok());

    harness.datastore.stop().await;
}

#[tokio::test]
async fn failed_submission_is_retried() {
    let harness = SyncHarness::new();
    harness.start().await;
    harness
        .backend
        .fail_next(SyncError::network_retryable("connection reset"));

    harness
        .datastore
        .save(&post(&harness.registry, "p1", "persistent"), None)
        .unwrap();
    assert!(harness.drained().await);
    assert_eq!(harness.backend.record("Post", "p1").unwrap().version, 1);
    assert_eq!(harness.backend.mutations().len(), 2);
    assert_eq!(harness.state(), EngineState::Syncing);

    harness.datastore.stop().await;
}

#[tokio::test]
async fn subscription_loss_restarts_the_cycle() {
    let harness = SyncHarness::new();
    harness.start().await;
    let engine = harness.datastore.engine().unwrap();
    let mut states = engine.states();

    harness.backend.disconnect_subscriptions("socket closed");
    let mut seen = Vec::new();
    loop {
        let state = states.recv().await.unwrap();
        seen.push(state.clone());
        if seen.len() > 1 && state == EngineState::Syncing {
            break;
        }
    }
    assert!(seen.contains(&EngineState::Configuring));
    assert_eq!(harness.backend.subscription_count(), 9);

    harness.datastore.stop().await;
}

#[tokio::test]
async fn composite_keys_sync_with_joined_identifiers() {
    let harness = SyncHarness::new();
    harness.start().await;
    let m = membership(&harness.registry, "t1", "u1", "member");
    harness.datastore.save(&m, None).unwrap();
    assert!(harness.drained().await);
    assert_eq!(harness.backend.record("Membership", "t1#u1").unwrap().version, 1);

    let promoted = m.with("role", "admin").unwrap();
    harness.datastore.save(&promoted, None).unwrap();
    assert!(harness.drained().await);
    let remote = harness.backend.record("Membership", "t1#u1").unwrap();
    assert_eq!(remote.version, 2);
    assert_eq!(remote.data["role"], json!("admin"));
    assert_eq!(
        harness
            .datastore
            .local_store()
            .sync_metadata("Membership", "t1#u1")
            .unwrap()
            .version,
        2
    );

    harness.datastore.stop().await;
}

#[tokio::test]
async fn clear_stops_and_empties_the_store() {
    let harness = SyncHarness::new();
    harness.backend.set_offline(true);
    harness.datastore.start().unwrap();
    harness
        .datastore
        .save(&post(&harness.registry, "p1", "queued"), None)
        .unwrap();

    harness.datastore.clear().await.unwrap();
    assert!(harness.datastore.outbox().is_empty());
    let posts = schema(&harness.registry, "Post");
    assert!(harness.datastore.query_by_id(&posts, "p1").unwrap().is_none());
    assert!(harness.state().can_start());
}

#[tokio::test]
async fn observers_see_concurrent_writes_in_commit_order() {
    let harness = SyncHarness::new();
    let mut changes = harness.datastore.observe();
    std::thread::scope(|scope| {
        for writer in 0..4 {
            let harness = &harness;
            scope.spawn(move || {
                for i in 0..10 {
                    let model = post(&harness.registry, &format!("w{writer}-{i}"), "concurrent");
                    harness.datastore.save(&model, None).unwrap();
                }
            });
        }
    });

    let mut observed = Vec::new();
    while let Some(event) = changes.try_recv() {
        observed.push(event.model_id);
    }
    // Outbox sequences are assigned at commit.
    let committed: Vec<String> = harness
        .datastore
        .outbox()
        .pending()
        .into_iter()
        .map(|entry| entry.event.model_id)
        .collect();
    assert_eq!(observed.len(), 40);
    assert_eq!(observed, committed);
}

#[tokio::test]
async fn without_a_transport_writes_stay_local() {
    let registry = blog_registry();
    let datastore = datasync_engine::DataStore::builder(registry.clone())
        .build()
        .unwrap();
    datastore.save(&post(&registry, "p1", "local"), None).unwrap();
    assert!(datastore.outbox().is_empty());
    datastore.start().unwrap();
    assert_eq!(datastore.engine_state(), EngineState::Stopped);
}

#[tokio::test]
async fn shared_backend_propagates_between_clients() {
    let backend = Arc::new(InMemoryAppSync::new(blog_registry()));
    let alice = SyncHarness::with_backend(backend.clone(), fast_sync_config());
    let bob = SyncHarness::with_backend(backend, SyncConfig::default().with_retry(fast_sync_config().retry));
    alice.start().await;
    bob.start().await;

    alice
        .datastore
        .save(&post(&alice.registry, "p1", "from alice"), None)
        .unwrap();
    let posts = schema(&bob.registry, "Post");
    assert!(eventually(|| bob.datastore.query_by_id(&posts, "p1").unwrap().is_some()).await);
    assert!(eventually(|| {
        bob.datastore
            .local_store()
            .sync_metadata("Post", "p1")
            .is_some_and(|m| m.version == 1)
    })
    .await);

    alice.datastore.stop().await;
    bob.datastore.stop().await;
}
