//! Per-prefix long-poll state.
//!
//! A [`View`] holds the most recent key/value list observed for one watch
//! dependency and the store index at which it was observed. The poller for
//! the dependency is the only writer; the runner and replicators read
//! consistent `(pairs, last_index)` snapshots.
//!
//! The pair list is shared behind an `Arc`, so a snapshot is a cheap clone
//! and replicators never block the poller while iterating.

use crate::kv::KeyPair;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug)]
struct ViewInner {
    pairs: Arc<Vec<KeyPair>>,
    last_index: u64,
    last_seen: Option<Instant>,
}

/// A consistent `(pairs, last_index)` observation.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    /// Observed key-pairs, in key order.
    pub pairs: Arc<Vec<KeyPair>>,
    /// Store index the pairs were observed at.
    pub last_index: u64,
}

/// Long-poll state for a single watch dependency.
#[derive(Debug)]
pub struct View {
    dependency_id: String,
    inner: RwLock<ViewInner>,
}

impl View {
    /// Create an empty view that has not yet observed data.
    pub fn new(dependency_id: impl Into<String>) -> Self {
        Self {
            dependency_id: dependency_id.into(),
            inner: RwLock::new(ViewInner {
                pairs: Arc::new(Vec::new()),
                last_index: 0,
                last_seen: None,
            }),
        }
    }

    /// Identifier of the dependency this view tracks.
    pub fn dependency_id(&self) -> &str {
        &self.dependency_id
    }

    /// Replace the view's data and index atomically.
    pub async fn advance(&self, pairs: Vec<KeyPair>, index: u64) {
        let mut inner = self.inner.write().await;
        inner.pairs = Arc::new(pairs);
        inner.last_index = index;
        inner.last_seen = Some(Instant::now());
    }

    /// The index of the last observation (0 before any data).
    pub async fn last_index(&self) -> u64 {
        self.inner.read().await.last_index
    }

    /// Consistent snapshot of the current observation, or `None` if no
    /// data has been observed yet.
    pub async fn snapshot(&self) -> Option<ViewSnapshot> {
        let inner = self.inner.read().await;
        inner.last_seen?;
        Some(ViewSnapshot {
            pairs: Arc::clone(&inner.pairs),
            last_index: inner.last_index,
        })
    }

    /// Monotonic time of the last observation.
    pub async fn last_seen(&self) -> Option<Instant> {
        self.inner.read().await.last_seen
    }
}
