//! # datasync testkit
//!
//! Test utilities for datasync.
//!
//! This crate provides:
//! - Blog-schema fixtures (`Post`, `Comment`, composite-keyed `Membership`)
//!   and temporary stores
//! - [`InMemoryAppSync`]: an in-process GraphQL backend with versioned
//!   conflict detection, conditions, paged delta sync and subscriptions
//! - [`RecordingHub`]: a hub sink that records events for assertions
//! - [`SyncHarness`]: a syncing data store wired to the in-memory backend
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use datasync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn saves_reach_the_backend() {
//!     let harness = SyncHarness::new();
//!     harness.start().await;
//!     harness.datastore.save(&post(&harness.registry, "p1", "hi"), None).unwrap();
//!     assert!(harness.drained().await);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod appsync;
pub mod fixtures;
pub mod generators;
pub mod hub;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::appsync::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::hub::*;
    pub use crate::integration::*;
}

pub use appsync::{matches_filter, InMemoryAppSync, RemoteRecord};
pub use fixtures::*;
pub use generators::*;
pub use hub::RecordingHub;
pub use integration::*;
