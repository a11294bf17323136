// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! KV store facade.
//!
//! Defines the interface the replication core needs from the clustered KV
//! store: long-polling list queries routed to a named datacenter, plus
//! plain get/put/delete/list against the local datacenter. The daemon hands
//! us a concrete client; this trait decouples the core from its transport
//! and lets tests run against [`InMemoryKv`].
//!
//! # Long-poll semantics
//!
//! [`KvClient::list`] blocks up to `wait_time` while the server-side index
//! is at or below `wait_index`, then returns the current key set together
//! with the index at which it was observed. A response with an unchanged
//! index therefore means "nothing new within the wait window".
//!
//! # Write contract
//!
//! [`KeyUpdate`] carries a key, a value, and the flags word - nothing else.
//! Session bindings observed on the source are never part of a write:
//! sessions do not span datacenters.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Flag value the store reserves for keys held by a lock.
pub const LOCK_FLAG_VALUE: u64 = 0x2ddccbc058a50c18;

/// Flag value the store reserves for keys held by a semaphore.
pub const SEMAPHORE_FLAG_VALUE: u64 = 0xe0f69a2baa414de0;

/// Result type for KV facade operations.
pub type KvResult<T> = std::result::Result<T, KvError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = KvResult<T>> + Send + 'a>>;

/// Error from the underlying KV client.
#[derive(Debug, Clone)]
pub struct KvError {
    /// The facade operation that failed (e.g. "kv.list", "kv.put").
    pub operation: String,
    /// Human-readable failure description from the client.
    pub message: String,
}

impl KvError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for KvError {}

/// A single observed key.
///
/// `session` is informational only: it is never copied to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Full key path as stored.
    pub path: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Flags word, preserved verbatim by replication.
    pub flags: u64,
    /// Monotonic index assigned by the store to the last write of this key.
    pub modify_index: u64,
    /// Session holding this key, if any. Empty when unheld.
    pub session: String,
}

/// A write to the local datacenter.
///
/// Deliberately has no session field - see the module docs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdate {
    pub key: String,
    pub value: Vec<u8>,
    pub flags: u64,
}

/// Options for a long-polling list query.
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Datacenter to route the query to.
    pub datacenter: String,
    /// Block while the server index is at or below this value.
    pub wait_index: u64,
    /// Maximum time to block.
    pub wait_time: Duration,
    /// Permit stale reads from non-leader servers up to this age.
    pub max_stale: Option<Duration>,
}

/// Response to a list query.
#[derive(Debug, Clone)]
pub struct ListResponse {
    /// Key-pairs under the requested prefix, in key order.
    pub pairs: Vec<KeyPair>,
    /// Server index at which the pairs were observed.
    pub index: u64,
}

/// What the replication core needs from the KV store.
///
/// The daemon provides an implementation backed by the real client library.
/// List queries are routed to the datacenter named in [`ListOptions`];
/// every other operation acts on the local datacenter.
pub trait KvClient: Send + Sync + 'static {
    /// Long-poll the keys under `prefix` in the datacenter named in
    /// `options`.
    fn list(&self, prefix: &str, options: ListOptions) -> BoxFuture<'_, ListResponse>;

    /// Fetch a single key from the local datacenter.
    fn get(&self, key: &str) -> BoxFuture<'_, Option<KeyPair>>;

    /// Write a key to the local datacenter.
    fn put(&self, update: KeyUpdate) -> BoxFuture<'_, ()>;

    /// Delete a key from the local datacenter.
    fn delete(&self, key: &str) -> BoxFuture<'_, ()>;

    /// List the keys (names only) under `prefix` in the local datacenter.
    fn list_keys(&self, prefix: &str) -> BoxFuture<'_, Vec<String>>;

    /// The datacenter the local agent belongs to.
    fn agent_datacenter(&self) -> BoxFuture<'_, String>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// InMemoryKv: in-process multi-datacenter store for tests and examples
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    flags: u64,
    session: String,
    modify_index: u64,
}

#[derive(Debug, Default)]
struct DcState {
    index: u64,
    entries: BTreeMap<String, StoredEntry>,
}

impl DcState {
    fn pairs_under(&self, prefix: &str) -> Vec<KeyPair> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyPair {
                path: k.clone(),
                value: e.value.clone(),
                flags: e.flags,
                modify_index: e.modify_index,
                session: e.session.clone(),
            })
            .collect()
    }
}

/// In-process KV store with per-datacenter key spaces and real long-poll
/// blocking.
///
/// Each datacenter keeps a monotonic index that advances on every write or
/// delete; list queries block (up to `wait_time`) until the index passes
/// the caller's `wait_index`, exactly like the production store's blocking
/// queries. Used by the test suite and by embedders who want to exercise
/// the runner without a live cluster.
pub struct InMemoryKv {
    local_dc: String,
    state: Mutex<HashMap<String, DcState>>,
    notify: Notify,
}

impl InMemoryKv {
    /// Create a store whose local agent reports `local_dc`.
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            state: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// The datacenter this store's agent reports.
    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }

    /// Write a key in an arbitrary datacenter (flags 0, no session).
    pub fn seed(&self, dc: &str, key: &str, value: impl Into<Vec<u8>>) {
        self.seed_with(dc, key, value, 0, "");
    }

    /// Write a key in an arbitrary datacenter with explicit flags and
    /// session, as if a lock holder or bulk importer had written it there.
    pub fn seed_with(
        &self,
        dc: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
        flags: u64,
        session: &str,
    ) {
        {
            let mut state = self.state.lock().expect("kv state poisoned");
            let dc_state = state.entry(dc.to_string()).or_default();
            dc_state.index += 1;
            let modify_index = dc_state.index;
            dc_state.entries.insert(
                key.to_string(),
                StoredEntry {
                    value: value.into(),
                    flags,
                    session: session.to_string(),
                    modify_index,
                },
            );
        }
        self.notify.notify_waiters();
    }

    /// Delete a key in an arbitrary datacenter.
    pub fn remove(&self, dc: &str, key: &str) {
        {
            let mut state = self.state.lock().expect("kv state poisoned");
            let dc_state = state.entry(dc.to_string()).or_default();
            if dc_state.entries.remove(key).is_some() {
                dc_state.index += 1;
            }
        }
        self.notify.notify_waiters();
    }

    /// Snapshot the pairs under `prefix` in the named datacenter.
    pub fn pairs_under(&self, dc: &str, prefix: &str) -> Vec<KeyPair> {
        let state = self.state.lock().expect("kv state poisoned");
        state
            .get(dc)
            .map(|s| s.pairs_under(prefix))
            .unwrap_or_default()
    }

    /// Fetch a single key from the named datacenter.
    pub fn get_in(&self, dc: &str, key: &str) -> Option<KeyPair> {
        let state = self.state.lock().expect("kv state poisoned");
        state.get(dc).and_then(|s| {
            s.entries.get(key).map(|e| KeyPair {
                path: key.to_string(),
                value: e.value.clone(),
                flags: e.flags,
                modify_index: e.modify_index,
                session: e.session.clone(),
            })
        })
    }

    /// Current index of the named datacenter (0 if it has never been
    /// written).
    pub fn index_of(&self, dc: &str) -> u64 {
        let state = self.state.lock().expect("kv state poisoned");
        state.get(dc).map(|s| s.index).unwrap_or(0)
    }
}

impl KvClient for InMemoryKv {
    fn list(&self, prefix: &str, options: ListOptions) -> BoxFuture<'_, ListResponse> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + options.wait_time;
            loop {
                // Register interest before checking the index so a write
                // between the check and the await cannot be missed.
                let notified = self.notify.notified();
                tokio::pin!(notified);

                {
                    let state = self.state.lock().expect("kv state poisoned");
                    let dc_state = state.get(&options.datacenter);
                    let index = dc_state.map(|s| s.index).unwrap_or(0);
                    if index > options.wait_index || tokio::time::Instant::now() >= deadline {
                        let pairs = dc_state
                            .map(|s| s.pairs_under(&prefix))
                            .unwrap_or_default();
                        return Ok(ListResponse { pairs, index });
                    }
                }

                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Option<KeyPair>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.get_in(&self.local_dc, &key)) })
    }

    fn put(&self, update: KeyUpdate) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().expect("kv state poisoned");
                let dc_state = state.entry(self.local_dc.clone()).or_default();
                dc_state.index += 1;
                let modify_index = dc_state.index;
                dc_state.entries.insert(
                    update.key,
                    StoredEntry {
                        value: update.value,
                        flags: update.flags,
                        session: String::new(),
                        modify_index,
                    },
                );
            }
            self.notify.notify_waiters();
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.remove(&self.local_dc, &key);
            Ok(())
        })
    }

    fn list_keys(&self, prefix: &str) -> BoxFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let state = self.state.lock().expect("kv state poisoned");
            let keys = state
                .get(&self.local_dc)
                .map(|s| {
                    s.entries
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect()
                })
                .unwrap_or_default();
            Ok(keys)
        })
    }

    fn agent_datacenter(&self) -> BoxFuture<'_, String> {
        Box::pin(async move { Ok(self.local_dc.clone()) })
    }
}
