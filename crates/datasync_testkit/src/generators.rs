//! Property-based test generators using proptest.
//!
//! Identifiers are drawn from a small pool so that generated writes collide
//! on the same model instance often enough to exercise coalescing and
//! version ordering.

use datasync_model::{MutationType, QueryPredicate};
use datasync_model::predicate::field;
use proptest::prelude::*;

/// Strategy for post identifiers from a pool of five.
pub fn post_id_strategy() -> impl Strategy<Value = String> {
    (0u8..5).prop_map(|n| format!("p{n}"))
}

/// Strategy for post titles.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z ]{0,15}").expect("Invalid regex")
}

/// Strategy for mutation kinds.
pub fn mutation_type_strategy() -> impl Strategy<Value = MutationType> {
    prop_oneof![
        Just(MutationType::Create),
        Just(MutationType::Update),
        Just(MutationType::Delete),
    ]
}

/// A local write against the blog schema.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalWrite {
    /// Save a post.
    Save {
        /// Post id.
        id: String,
        /// Title.
        title: String,
        /// Rating.
        rating: i64,
    },
    /// Delete a post.
    Delete {
        /// Post id.
        id: String,
    },
}

impl LocalWrite {
    /// Post id the write targets.
    pub fn id(&self) -> &str {
        match self {
            LocalWrite::Save { id, .. } | LocalWrite::Delete { id } => id,
        }
    }
}

/// Strategy for local writes, saves three times as likely as deletes.
pub fn local_write_strategy() -> impl Strategy<Value = LocalWrite> {
    prop_oneof![
        3 => (post_id_strategy(), title_strategy(), 0i64..10)
            .prop_map(|(id, title, rating)| LocalWrite::Save { id, title, rating }),
        1 => post_id_strategy().prop_map(|id| LocalWrite::Delete { id }),
    ]
}

/// Strategy for a sequence of local writes.
pub fn write_sequence_strategy(
    min_writes: usize,
    max_writes: usize,
) -> impl Strategy<Value = Vec<LocalWrite>> {
    prop::collection::vec(local_write_strategy(), min_writes..max_writes)
}

/// Strategy for remote versions arriving in arbitrary order.
pub fn version_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(1i64..50, 1..max_len)
}

/// Strategy for simple predicates over `Post.rating` and `Post.title`.
pub fn post_predicate_strategy() -> impl Strategy<Value = QueryPredicate> {
    let leaf = prop_oneof![
        (0i64..10).prop_map(|r| field("rating").gt(r)),
        (0i64..10).prop_map(|r| field("rating").le(r)),
        "[a-z]{1,2}".prop_map(|p| field("title").begins_with(p)),
    ];
    leaf.prop_recursive(2, 8, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..3).prop_map(QueryPredicate::and),
            prop::collection::vec(inner.clone(), 1..3).prop_map(QueryPredicate::or),
            inner.prop_map(QueryPredicate::not),
        ]
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 512,
            max_shrink_iters: 5000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
