//! Configuration for the sync engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datasync_model::{Model, QueryPredicate};
use rand::Rng;

/// Configuration for sync operations.
#[derive(Clone)]
pub struct SyncConfig {
    /// Rows requested per initial-sync page.
    pub sync_page_size: u64,
    /// Outbox mutations submitted concurrently (at most one per model id).
    pub max_in_flight: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// A `lastSync` cursor older than this triggers a full sync.
    pub full_sync_interval: Duration,
    /// Per-model predicates restricting what is synced.
    pub sync_expressions: HashMap<String, QueryPredicate>,
    /// Policy for mutations the backend rejects with a version conflict.
    pub conflict_handler: ConflictHandler,
    /// How long to wait for every subscription to connect.
    pub subscription_connect_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with the defaults.
    pub fn new() -> Self {
        Self {
            sync_page_size: 1000,
            max_in_flight: 4,
            retry: RetryConfig::default(),
            full_sync_interval: Duration::from_secs(24 * 60 * 60),
            sync_expressions: HashMap::new(),
            conflict_handler: ConflictHandler::ServerWins,
            subscription_connect_timeout: Duration::from_secs(15),
        }
    }

    /// Sets the initial-sync page size.
    pub fn with_sync_page_size(mut self, size: u64) -> Self {
        self.sync_page_size = size.max(1);
        self
    }

    /// Sets the outbox concurrency bound.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the full-sync interval.
    pub fn with_full_sync_interval(mut self, interval: Duration) -> Self {
        self.full_sync_interval = interval;
        self
    }

    /// Restricts what `model` syncs.
    pub fn with_sync_expression(mut self, model: impl Into<String>, predicate: QueryPredicate) -> Self {
        self.sync_expressions.insert(model.into(), predicate);
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_handler(mut self, handler: ConflictHandler) -> Self {
        self.conflict_handler = handler;
        self
    }

    /// Sets the subscription connect timeout.
    pub fn with_subscription_connect_timeout(mut self, timeout: Duration) -> Self {
        self.subscription_connect_timeout = timeout;
        self
    }

    /// The sync expression of `model`, if any.
    pub fn sync_expression(&self, model: &str) -> Option<&QueryPredicate> {
        self.sync_expressions.get(model).filter(|p| !p.is_all())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("sync_page_size", &self.sync_page_size)
            .field("max_in_flight", &self.max_in_flight)
            .field("retry", &self.retry)
            .field("full_sync_interval", &self.full_sync_interval)
            .field("sync_expressions", &self.sync_expressions.keys().collect::<Vec<_>>())
            .field("conflict_handler", &self.conflict_handler)
            .field("subscription_connect_timeout", &self.subscription_connect_timeout)
            .finish()
    }
}

/// The local and remote copies of a conflicting mutation.
#[derive(Debug, Clone)]
pub struct ConflictData {
    /// The model the client tried to write.
    pub local: Model,
    /// The copy the backend holds.
    pub remote: Model,
}

/// A conflict policy decision.
#[derive(Debug, Clone)]
pub enum ConflictResolution {
    /// Discard the local change and keep the backend's copy.
    ApplyRemote,
    /// Resubmit the local model with the backend's version.
    RetryLocal,
    /// Submit this model with the backend's version.
    Retry(Model),
}

/// Application callback deciding a conflict.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Decides how to resolve `data`.
    async fn resolve(&self, data: ConflictData) -> ConflictResolution;
}

/// How version conflicts on outgoing mutations are resolved.
#[derive(Clone, Default)]
pub enum ConflictHandler {
    /// The backend's copy wins.
    #[default]
    ServerWins,
    /// The local change is resubmitted with the backend's version.
    RetryLocal,
    /// The application decides.
    Custom(Arc<dyn ConflictResolver>),
}

impl ConflictHandler {
    /// Resolves a conflict under this policy.
    pub async fn resolve(&self, data: ConflictData) -> ConflictResolution {
        match self {
            ConflictHandler::ServerWins => ConflictResolution::ApplyRemote,
            ConflictHandler::RetryLocal => ConflictResolution::RetryLocal,
            ConflictHandler::Custom(resolver) => resolver.resolve(data).await,
        }
    }
}

impl fmt::Debug for ConflictHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictHandler::ServerWins => f.write_str("ServerWins"),
            ConflictHandler::RetryLocal => f.write_str("RetryLocal"),
            ConflictHandler::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Backoff shared by request retries, outbox resubmission and engine
/// restarts.
///
/// Attempt `n` (from 1) waits `base_delay * 2^n` plus a random extra below
/// `jitter`, never longer than `max_delay`. Attempt 0 does not wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Tries per request before the error surfaces. Also bounds the version
    /// conflicts resolved for one mutation.
    pub max_attempts: u32,
    /// Unit of the doubling schedule.
    pub base_delay: Duration,
    /// Exclusive bound of the random extra wait.
    pub jitter: Duration,
    /// Ceiling for one wait.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// `max_attempts` tries with 100ms steps, 100ms of jitter and a five
    /// minute ceiling.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(100),
            jitter: Duration::from_millis(100),
            max_delay: Duration::from_secs(300),
        }
    }

    /// One try per request; failures surface immediately.
    pub fn single_attempt() -> Self {
        Self::new(1)
    }

    /// Sets the unit of the doubling schedule.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the jitter bound. `Duration::ZERO` makes waits deterministic.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the ceiling for one wait.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Wait before attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let jitter = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter > 0 {
            rand::thread_rng().gen_range(0..jitter)
        } else {
            0
        };
        let ceiling = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).saturating_add(extra).min(ceiling))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_model::predicate::field;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_sync_page_size(50)
            .with_max_in_flight(0)
            .with_full_sync_interval(Duration::from_secs(60))
            .with_sync_expression("Post", field("rating").gt(3));

        assert_eq!(config.sync_page_size, 50);
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.full_sync_interval, Duration::from_secs(60));
        assert!(config.sync_expression("Post").is_some());
        assert!(config.sync_expression("Comment").is_none());
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_page_size, 1000);
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.full_sync_interval, Duration::from_secs(86_400));
        assert!(matches!(config.conflict_handler, ConflictHandler::ServerWins));
    }

    #[tokio::test]
    async fn builtin_handlers() {
        use datasync_model::{FieldType, ModelField, ModelSchema};
        let schema = ModelSchema::builder("Post")
            .field(ModelField::id())
            .field(ModelField::new("title", FieldType::String))
            .build()
            .unwrap();
        let model = Model::builder(&schema).set("id", "p1").build().unwrap();
        let data = ConflictData {
            local: model.clone(),
            remote: model,
        };
        assert!(matches!(
            ConflictHandler::ServerWins.resolve(data.clone()).await,
            ConflictResolution::ApplyRemote
        ));
        assert!(matches!(
            ConflictHandler::RetryLocal.resolve(data).await,
            ConflictResolution::RetryLocal
        ));
    }
}
