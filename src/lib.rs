//! # Consul Replicate
//!
//! Core of a cross-datacenter KV replication daemon: maintains an
//! eventually-consistent copy of key-prefix subtrees from a remote
//! datacenter (the authoritative source) into the local datacenter of a
//! clustered KV store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            consul-replicate                             │
//! │                                                                         │
//! │  ┌──────────────┐ views  ┌────────────┐  quiesce  ┌──────────────────┐  │
//! │  │ Watcher      │───────►│ Runner     │──────────►│ Replicators      │  │
//! │  │ (one poller  │        │ (event     │           │ (one per prefix, │  │
//! │  │  per prefix, │        │  loop +    │           │  puts + deletes  │  │
//! │  │  long-poll)  │        │  gate)     │           │  + checkpoint)   │  │
//! │  └──────────────┘        └────────────┘           └──────────────────┘  │
//! │         │                                                  │            │
//! │         ▼                                                  ▼            │
//! │  ┌──────────────┐                               ┌─────────────────────┐ │
//! │  │ source KV    │                               │ destination KV      │ │
//! │  │ (remote DC)  │                               │ (local DC + Status) │ │
//! │  └──────────────┘                               └─────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Semantics
//!
//! Master-slave: the source is authoritative, the destination mirrors it.
//! Updates are idempotent puts applied at-least-once; progress is
//! checkpointed per prefix in the destination KV itself, so a restarted
//! daemon resumes where it left off. Values and flags are preserved
//! byte-exactly; session bindings are never copied across datacenters.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use consul_replicate::{ReplicationConfig, Runner};
//! use consul_replicate::kv::InMemoryKv;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> consul_replicate::Result<()> {
//!     let config = ReplicationConfig {
//!         prefixes: vec![
//!             consul_replicate::PrefixConfig::parse("global@dc1:backup")?,
//!         ],
//!         ..Default::default()
//!     };
//!     let client = Arc::new(InMemoryKv::new("dc2"));
//!
//!     let mut runner = Runner::new(config, client, false)?;
//!     runner.start().await?;
//!     runner.wait().await // runs until stopped or a terminal error
//! }
//! ```

pub mod config;
pub mod error;
pub mod exclude;
pub mod kv;
pub mod metrics;
pub mod quiescence;
pub mod replicator;
pub mod resilience;
pub mod runner;
pub mod status;
pub mod view;
pub mod watcher;

// Re-exports for convenience
pub use config::{ExcludeConfig, PrefixConfig, ReplicationConfig, WaitConfig};
pub use error::{ReplicationError, Result};
pub use exclude::ExcludeFilter;
pub use kv::{KeyPair, KeyUpdate, KvClient};
pub use quiescence::QuiescenceGate;
pub use replicator::RunStats;
pub use resilience::RetryConfig;
pub use runner::{DependencyHealth, Runner, RunnerHealth, RunnerState};
pub use status::{Status, StatusStore};
pub use view::{View, ViewSnapshot};
pub use watcher::{Watcher, WatcherConfig};
