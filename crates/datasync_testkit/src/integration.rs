//! Harness wiring a [`DataStore`] to an [`InMemoryAppSync`] backend.

use std::sync::Arc;
use std::time::Duration;

use datasync_engine::{DataStore, EngineState, RetryConfig, SyncConfig};
use datasync_model::ModelRegistry;
use tokio::time::Instant;

use crate::appsync::InMemoryAppSync;
use crate::fixtures::blog_registry;
use crate::hub::RecordingHub;

/// How long [`eventually`] polls before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sync configuration with millisecond backoff, for tests.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig::new()
        .with_retry(
            RetryConfig::new(5)
                .with_base_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(50))
                .with_jitter(Duration::ZERO),
        )
        .with_subscription_connect_timeout(Duration::from_secs(2))
}

/// Polls `condition` until it holds or [`WAIT_TIMEOUT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A syncing data store, its backend and a hub recorder.
///
/// Must be created inside a Tokio runtime.
pub struct SyncHarness {
    /// Registry shared by the store and the backend.
    pub registry: ModelRegistry,
    /// The backend.
    pub backend: Arc<InMemoryAppSync>,
    /// Hub events dispatched by the store and the engine.
    pub hub: Arc<RecordingHub>,
    /// The store under test.
    pub datastore: DataStore,
}

impl SyncHarness {
    /// Blog schema, empty backend, [`fast_sync_config`].
    pub fn new() -> Self {
        Self::with_config(fast_sync_config())
    }

    /// Blog schema and an empty backend with `config`.
    pub fn with_config(config: SyncConfig) -> Self {
        let backend = Arc::new(InMemoryAppSync::new(blog_registry()));
        Self::with_backend(backend, config)
    }

    /// Blog schema against an existing backend.
    pub fn with_backend(backend: Arc<InMemoryAppSync>, config: SyncConfig) -> Self {
        let registry = blog_registry();
        let hub = Arc::new(RecordingHub::new());
        let datastore = DataStore::builder(registry.clone())
            .sync_config(config)
            .transport(backend.clone())
            .hub(hub.clone())
            .build()
            .expect("build datastore");
        Self {
            registry,
            backend,
            hub,
            datastore,
        }
    }

    /// Starts the engine and waits until it is syncing.
    pub async fn start(&self) {
        self.datastore
            .start_and_wait()
            .await
            .expect("engine reaches syncing");
    }

    /// Waits until every queued mutation was acknowledged.
    pub async fn drained(&self) -> bool {
        eventually(|| self.datastore.outbox().is_empty()).await
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.datastore.engine_state()
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}
