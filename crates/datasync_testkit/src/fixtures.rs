//! Test fixtures: a small blog schema, model helpers and temporary stores.

use std::sync::{Arc, Once};

use datasync_model::{FieldType, Model, ModelField, ModelRegistry, ModelSchema};
use datasync_storage::{LocalStore, StoreConfig};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// `Post { id, title!, content, rating, comments: [Comment] }`.
pub fn post_schema() -> Arc<ModelSchema> {
    ModelSchema::builder("Post")
        .field(ModelField::id())
        .field(ModelField::new("title", FieldType::String).required())
        .field(ModelField::new("content", FieldType::String))
        .field(ModelField::new("rating", FieldType::Int))
        .field(ModelField::has_many("comments", "Comment", "post"))
        .build()
        .expect("post schema")
}

/// `Comment { id, content!, post: Post (postId) }`.
pub fn comment_schema() -> Arc<ModelSchema> {
    ModelSchema::builder("Comment")
        .field(ModelField::id())
        .field(ModelField::new("content", FieldType::String).required())
        .field(ModelField::belongs_to("post", "Post", "postId"))
        .build()
        .expect("comment schema")
}

/// `Membership { teamId, userId, role }`, keyed by both ids.
pub fn membership_schema() -> Arc<ModelSchema> {
    ModelSchema::builder("Membership")
        .field(ModelField::new("teamId", FieldType::String).required().primary_key())
        .field(ModelField::new("userId", FieldType::String).required().primary_key())
        .field(ModelField::new("role", FieldType::String))
        .build()
        .expect("membership schema")
}

/// Registry holding `Post`, `Comment` and `Membership`.
pub fn blog_registry() -> ModelRegistry {
    ModelRegistry::builder()
        .register(comment_schema())
        .register(post_schema())
        .register(membership_schema())
        .build()
        .expect("blog registry")
}

/// Shorthand for a registered schema.
pub fn schema(registry: &ModelRegistry, name: &str) -> Arc<ModelSchema> {
    registry.schema(name).expect("registered schema").clone()
}

/// A post with a title.
pub fn post(registry: &ModelRegistry, id: &str, title: &str) -> Model {
    Model::builder(&schema(registry, "Post"))
        .set("id", id)
        .set("title", title)
        .build()
        .expect("post")
}

/// A post with a title and a rating.
pub fn rated_post(registry: &ModelRegistry, id: &str, title: &str, rating: i64) -> Model {
    Model::builder(&schema(registry, "Post"))
        .set("id", id)
        .set("title", title)
        .set("rating", rating)
        .build()
        .expect("rated post")
}

/// A comment on `post_id`.
pub fn comment(registry: &ModelRegistry, id: &str, post_id: &str, content: &str) -> Model {
    Model::builder(&schema(registry, "Comment"))
        .set("id", id)
        .set("content", content)
        .set("post", post_id)
        .build()
        .expect("comment")
}

/// A membership of `user_id` in `team_id`.
pub fn membership(registry: &ModelRegistry, team_id: &str, user_id: &str, role: &str) -> Model {
    Model::builder(&schema(registry, "Membership"))
        .set("teamId", team_id)
        .set("userId", user_id)
        .set("role", role)
        .build()
        .expect("membership")
}

/// A store persisted to a temporary directory, removed on drop.
pub struct TestStore {
    /// The store.
    pub store: Arc<LocalStore>,
    dir: TempDir,
}

impl TestStore {
    /// Opens a blog store in a fresh temporary directory.
    pub fn blog() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalStore::open_dir(dir.path(), blog_registry(), StoreConfig::default())
            .expect("open store");
        Self {
            store: Arc::new(store),
            dir,
        }
    }

    /// Directory the store lives in.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Reopens the store from disk, replaying its journal.
    pub fn reopen(&mut self) {
        let store = LocalStore::open_dir(self.dir.path(), blog_registry(), StoreConfig::default())
            .expect("reopen store");
        self.store = Arc::new(store);
    }
}

impl std::ops::Deref for TestStore {
    type Target = LocalStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// In-memory blog store.
pub fn memory_store() -> Arc<LocalStore> {
    Arc::new(LocalStore::in_memory(blog_registry()).expect("in-memory store"))
}

/// Installs a test tracing subscriber once, filtered by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
