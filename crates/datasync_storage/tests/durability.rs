//! Journal durability: replay, torn frames, compaction and locking.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use datasync_model::{
    FieldType, Model, ModelField, ModelRegistry, ModelSchema, ModelSyncMetadata, MutationEvent,
    MutationSyncMetadata, MutationType,
};
use datasync_storage::{
    DeleteTarget, InMemoryBackend, LocalStore, OutboxRecord, StorageError, StoreConfig,
};
use tempfile::tempdir;

fn registry() -> (ModelRegistry, Arc<ModelSchema>) {
    let post = ModelSchema::builder("Post")
        .field(ModelField::id())
        .field(ModelField::new("title", FieldType::String))
        .build()
        .unwrap();
    let registry = ModelRegistry::builder().register(post.clone()).build().unwrap();
    (registry, post)
}

fn post(schema: &Arc<ModelSchema>, id: &str, title: &str) -> Model {
    Model::builder(schema)
        .set("id", id)
        .set("title", title)
        .build()
        .unwrap()
}

#[test]
fn state_survives_reopen() {
    let dir = tempdir().unwrap();
    let (registry, schema) = registry();
    {
        let store = LocalStore::open_dir(dir.path(), registry.clone(), StoreConfig::default()).unwrap();
        let saved = store.save(&post(&schema, "p1", "a"), None).unwrap();
        store.save(&post(&schema, "p2", "b"), None).unwrap();
        store
            .delete(&schema, DeleteTarget::Id("p2".into()), None)
            .unwrap();
        store
            .save_sync_metadata(MutationSyncMetadata {
                model_id: "p1".into(),
                model_name: "Post".into(),
                version: 3,
                deleted: false,
                last_changed_at: 10,
            })
            .unwrap();
        store
            .save_sync_state(ModelSyncMetadata {
                model_name: "Post".into(),
                last_sync: Some(99),
                next_token: None,
            })
            .unwrap();
        store
            .write_transaction(|txn| {
                let sequence = txn.next_outbox_sequence();
                txn.put_outbox(OutboxRecord::new(sequence, saved.event.clone()));
                Ok(())
            })
            .unwrap();
    }

    let store = LocalStore::open_dir(dir.path(), registry, StoreConfig::default()).unwrap();
    assert_eq!(store.count("Post"), 1);
    assert_eq!(store.sync_metadata("Post", "p1").unwrap().version, 3);
    assert_eq!(store.sync_state("Post").unwrap().last_sync, Some(99));
    let outbox = store.outbox_records();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].event.mutation_type, MutationType::Create);
}

#[test]
fn torn_write_is_discarded() {
    let dir = tempdir().unwrap();
    let (registry, schema) = registry();
    {
        let store = LocalStore::open_dir(dir.path(), registry.clone(), StoreConfig::default()).unwrap();
        store.save(&post(&schema, "p1", "a"), None).unwrap();
    }
    {
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("journal.dsj"))
            .unwrap();
        // Start of a frame whose payload never made it to disk.
        file.write_all(b"DSJL\x01\x00\x01\xff\x00\x00\x00partial").unwrap();
    }
    let store = LocalStore::open_dir(dir.path(), registry.clone(), StoreConfig::default()).unwrap();
    assert_eq!(store.count("Post"), 1);
    store.save(&post(&schema, "p2", "b"), None).unwrap();
    drop(store);

    let store = LocalStore::open_dir(dir.path(), registry, StoreConfig::default()).unwrap();
    assert_eq!(store.count("Post"), 2);
}

#[test]
fn compaction_keeps_state() {
    let (registry, schema) = registry();
    let backend = InMemoryBackend::new();
    let config = StoreConfig::new().with_compaction_threshold(4);
    {
        let store = LocalStore::open(registry.clone(), Box::new(backend.clone()), config.clone()).unwrap();
        for i in 0..10 {
            store.save(&post(&schema, "p1", &format!("v{i}")), None).unwrap();
        }
        store.save(&post(&schema, "p2", "x"), None).unwrap();
    }
    let compacted_len = backend.data().len();

    let store = LocalStore::open(registry, Box::new(backend), config).unwrap();
    let schema = store.registry().schema("Post").unwrap().clone();
    let row = store.query_by_id(&schema, "p1").unwrap().unwrap();
    assert_eq!(row.get("title").as_str(), Some("v9"));
    assert_eq!(store.count("Post"), 2);
    assert!(store.journal_size().unwrap() as usize == compacted_len);
}

#[test]
fn second_store_on_same_dir_is_refused() {
    let dir = tempdir().unwrap();
    let (registry, _) = registry();
    let _first = LocalStore::open_dir(dir.path(), registry.clone(), StoreConfig::default()).unwrap();
    let second = LocalStore::open_dir(dir.path(), registry, StoreConfig::default());
    assert!(matches!(second, Err(StorageError::Locked(_))));
}

#[test]
fn clear_empties_every_table() {
    let (registry, schema) = registry();
    let store = LocalStore::in_memory(registry).unwrap();
    let saved = store.save(&post(&schema, "p1", "a"), None).unwrap();
    store
        .write_transaction(|txn| {
            txn.put_outbox(OutboxRecord::new(1, saved.event.clone()));
            Ok(())
        })
        .unwrap();
    store.clear().unwrap();
    assert_eq!(store.count("Post"), 0);
    assert!(store.outbox_records().is_empty());

    let event = MutationEvent::new(&post(&schema, "p9", "z"), MutationType::Delete);
    assert_eq!(event.model_id, "p9");
}
