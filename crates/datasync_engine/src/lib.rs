//! # datasync engine
//!
//! Offline-first synchronization of local models with a GraphQL backend.
//!
//! This crate provides:
//! - [`StateMachine`]: a reducer-driven state machine with ordered state
//!   publication, used for the engine lifecycle ([`EngineState`])
//! - [`EventPublisher`]: ordered fan-out with unsubscribe tokens
//! - [`MutationOutbox`]: the durable, coalescing queue of local writes
//! - [`Reconciler`]: version-based merging of remote changes
//! - [`RemoteSyncEngine`]: initial sync, subscriptions and outbox draining
//! - [`DataStore`]: the application-facing facade
//! - Transport, authorization and hub capabilities the host supplies
//!
//! ## Architecture
//!
//! Local writes go to the store and the outbox in one transaction. The
//! engine drains the outbox in enqueue order per model instance and stores
//! the version the backend returns. Remote changes from the initial sync and
//! from subscriptions pass through the reconciler, which only applies a
//! change whose version is higher than the local one and defers changes for
//! instances with queued local writes.
//!
//! ## Key Invariants
//!
//! - Sync metadata versions never decrease
//! - Mutations for one model instance are submitted in enqueue order
//! - The lifecycle reducer never runs concurrently with itself
//! - Terminal errors tear the engine down; they are never swallowed

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod datastore;
mod engine;
mod error;
mod hub;
mod initial_sync;
mod lifecycle;
mod outbox;
mod outgoing;
mod publisher;
mod reconciler;
mod state_machine;
mod subscriptions;
mod transport;

pub use config::{
    ConflictData, ConflictHandler, ConflictResolution, ConflictResolver, RetryConfig, SyncConfig,
};
pub use datastore::{DataStore, DataStoreBuilder};
pub use engine::RemoteSyncEngine;
pub use error::{SyncError, SyncResult};
pub use hub::{HubEvent, HubSink, NoopHub};
pub use lifecycle::{reduce, EngineAction, EngineState};
pub use outbox::{
    enqueue_in, has_pending_in, AckOutcome, Enqueued, MutationOutbox, OutboxHandle,
    PendingMutation,
};
pub use publisher::{Completion, EventPublisher, Subscription, SubscriptionToken};
pub use reconciler::{Disposition, Reconciler};
pub use state_machine::{Reducer, StateMachine};
pub use transport::{
    ApiKeyAuth, AuthProvider, ConnectionState, GraphQLTransport, Headers, MockTransport, NoAuth,
    SubscriptionEvent,
};
