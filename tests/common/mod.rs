//! Shared harness for integration tests.
//!
//! Tests drive the real runner against an in-process [`InMemoryKv`]: the
//! "source" datacenter is `dc1`, the local (destination) datacenter is
//! `dc2`.

#![allow(dead_code)]

use consul_replicate::config::{ExcludeConfig, ReplicationConfig};
use consul_replicate::kv::{InMemoryKv, KvClient};
use consul_replicate::Runner;
use std::sync::Arc;
use std::time::Duration;

/// The remote, authoritative datacenter.
pub const SOURCE_DC: &str = "dc1";

/// The local datacenter the daemon writes into.
pub const LOCAL_DC: &str = "dc2";

/// A two-datacenter cluster backed by the in-memory store.
pub struct TestCluster {
    pub kv: Arc<InMemoryKv>,
}

/// Route tracing output through the test harness. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

impl TestCluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            kv: Arc::new(InMemoryKv::new(LOCAL_DC)),
        }
    }

    /// Write a key in the source datacenter.
    pub fn seed_source(&self, key: &str, value: &str) {
        self.kv.seed(SOURCE_DC, key, value);
    }

    /// Write a key directly into the local datacenter (pre-existing local
    /// state).
    pub fn seed_local(&self, key: &str, value: &str) {
        self.kv.seed(LOCAL_DC, key, value);
    }

    /// The value of a local key, if present.
    pub fn local_value(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.get_in(LOCAL_DC, key).map(|p| p.value)
    }

    /// Build a test config for one prefix plus excludes.
    pub fn config(&self, prefix: &str, excludes: &[&str]) -> ReplicationConfig {
        let mut config = ReplicationConfig::for_testing(prefix);
        for exclude in excludes {
            config.excludes.push(ExcludeConfig::parse(exclude).unwrap());
        }
        config
    }

    /// Run the daemon once to completion.
    pub async fn run_once(&self, config: ReplicationConfig) -> consul_replicate::Result<()> {
        let mut runner = Runner::new(config, self.client(), true)?;
        runner.start().await?;
        tokio::time::timeout(Duration::from_secs(10), runner.wait())
            .await
            .expect("once-mode run timed out")
    }

    /// Start the daemon in watch mode; the caller stops it.
    pub async fn start_daemon(&self, config: ReplicationConfig) -> Runner {
        let mut runner = Runner::new(config, self.client(), false).expect("valid config");
        runner.start().await.expect("runner starts");
        runner
    }

    /// Poll until a local key appears.
    pub async fn wait_for_local(&self, key: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.kv.get_in(LOCAL_DC, key).is_none() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for local key {key:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until a local key disappears.
    pub async fn wait_for_local_absent(&self, key: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.kv.get_in(LOCAL_DC, key).is_some() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for local key {key:?} to be deleted"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn client(&self) -> Arc<dyn KvClient> {
        Arc::clone(&self.kv) as Arc<dyn KvClient>
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
