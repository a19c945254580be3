//! Property tests for outbox coalescing and version-ordered reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use datasync_engine::{enqueue_in, Disposition, EventPublisher, NoopHub, Reconciler};
use datasync_model::{MutationSync, MutationSyncMetadata, MutationType};
use datasync_storage::DeleteTarget;
use datasync_testkit::prelude::*;
use proptest::prelude::*;

fn apply_writes(writes: &[LocalWrite]) -> (Arc<datasync_storage::LocalStore>, HashMap<String, Option<String>>) {
    let store = memory_store();
    let registry = store.registry().clone();
    let posts = schema(&registry, "Post");
    // Last effective write per id: Some(title) for a save, None for a delete.
    let mut last = HashMap::new();
    for write in writes {
        match write {
            LocalWrite::Save { id, title, rating } => {
                let model = rated_post(&registry, id, title, *rating);
                store
                    .write_transaction(|txn| {
                        let saved = txn.save(&model, None)?;
                        enqueue_in(txn, saved.event)
                    })
                    .unwrap();
                last.insert(id.clone(), Some(title.clone()));
            }
            LocalWrite::Delete { id } => {
                let removed = store
                    .write_transaction(|txn| {
                        let deleted = txn.delete(&posts, &DeleteTarget::Id(id.clone()), None)?;
                        for event in deleted.events {
                            enqueue_in(txn, event)?;
                        }
                        Ok(deleted.models.len())
                    })
                    .unwrap();
                if removed > 0 {
                    last.insert(id.clone(), None);
                }
            }
        }
    }
    (store, last)
}

proptest! {
    #![proptest_config(PropTestConfig::default().to_proptest_config())]

    #[test]
    fn outbox_keeps_one_live_entry_per_instance(writes in write_sequence_strategy(1, 40)) {
        let (store, last) = apply_writes(&writes);
        let registry = store.registry().clone();
        let records = store.outbox_records();

        let ids: HashSet<&str> = records.iter().map(|r| r.model_id()).collect();
        let written: HashSet<&str> = last.keys().map(String::as_str).collect();
        prop_assert_eq!(ids, written);

        for (id, expected) in &last {
            let entries: Vec<_> = records.iter().filter(|r| r.model_id() == id).collect();
            let (newest, older) = entries.split_last().unwrap();
            for entry in older {
                prop_assert_eq!(entry.event.mutation_type, MutationType::Delete);
            }
            match expected {
                Some(title) => {
                    prop_assert_ne!(newest.event.mutation_type, MutationType::Delete);
                    let model = newest.event.decode_model(&registry).unwrap();
                    prop_assert_eq!(model.get("title").as_str(), Some(title.as_str()));
                }
                None => prop_assert_eq!(newest.event.mutation_type, MutationType::Delete),
            }
        }

        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        prop_assert_eq!(sequences, sorted);
    }

    #[test]
    fn local_version_is_the_highest_seen(versions in version_sequence_strategy(20)) {
        let store = memory_store();
        let registry = store.registry().clone();
        let reconciler = Reconciler::new(
            store.clone(),
            EventPublisher::new(),
            Arc::new(NoopHub),
            HashMap::new(),
        );

        let mut highest = 0;
        for version in &versions {
            let remote = MutationSync {
                model: post(&registry, "p1", &format!("v{version}")),
                sync_metadata: MutationSyncMetadata {
                    model_id: "p1".into(),
                    model_name: "Post".into(),
                    version: *version,
                    deleted: false,
                    last_changed_at: 0,
                },
            };
            let disposition = reconciler.reconcile(remote).unwrap();
            if *version > highest {
                prop_assert!(matches!(disposition, Disposition::Applied(_)));
                highest = *version;
            } else {
                prop_assert_eq!(disposition, Disposition::Dropped);
            }
        }

        prop_assert_eq!(store.sync_metadata("Post", "p1").map(|m| m.version), Some(highest));
        let stored = store.query_by_id(&schema(&registry, "Post"), "p1").unwrap().unwrap();
        let expected = format!("v{highest}");
        prop_assert_eq!(stored.get("title").as_str(), Some(expected.as_str()));
    }
}

#[test]
fn create_then_delete_leaves_a_single_delete() {
    let (store, _) = apply_writes(&[
        LocalWrite::Save {
            id: "p1".into(),
            title: "draft".into(),
            rating: 1,
        },
        LocalWrite::Delete { id: "p1".into() },
    ]);
    let records = store.outbox_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event.mutation_type, MutationType::Delete);
}

#[test]
fn save_after_delete_is_a_separate_create() {
    let (store, _) = apply_writes(&[
        LocalWrite::Save {
            id: "p1".into(),
            title: "a".into(),
            rating: 1,
        },
        LocalWrite::Delete { id: "p1".into() },
        LocalWrite::Save {
            id: "p1".into(),
            title: "b".into(),
            rating: 2,
        },
    ]);
    let kinds: Vec<MutationType> = store
        .outbox_records()
        .iter()
        .map(|r| r.event.mutation_type)
        .collect();
    assert_eq!(kinds, vec![MutationType::Delete, MutationType::Create]);
}
