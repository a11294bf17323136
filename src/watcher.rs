// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Long-poll watcher: one poller per dependency, fanned into one channel.
//!
//! Each registered prefix gets a poller task that repeatedly issues a
//! blocking list query against the source datacenter with
//! `wait_index = last index seen`. When the store's index moves past it,
//! the poller swaps the new data into its [`View`] and publishes the view
//! on the shared data channel for the runner to consume. A response whose
//! index is unchanged is suppressed - no publish, no spurious run.
//!
//! # Error handling
//!
//! Transport errors are retried with bounded exponential backoff
//! ([`RetryConfig`]). When the budget is exhausted the poller emits a
//! terminal error on the shared error channel and exits; the runner treats
//! that as fatal.
//!
//! # Shutdown
//!
//! [`Watcher::stop()`] flips a watch channel and joins every poller. A
//! poller caught mid-request cancels the in-flight long-poll (dropping
//! the future aborts the request), so stop returns promptly instead of
//! riding out the poll `wait_time`.
//!
//! # Once mode
//!
//! In once mode each poller publishes its first fresh view and returns;
//! the runner counts the publications and performs a single run.

use crate::config::PrefixConfig;
use crate::error::ReplicationError;
use crate::kv::{KvClient, ListOptions};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::view::View;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

/// Standard long-poll window of the underlying KV store.
pub const LONG_POLL_WAIT: Duration = Duration::from_secs(30);

/// Buffer size of the shared data channel.
const DATA_CHANNEL_CAPACITY: usize = 64;

/// Watcher settings, derived from the runner's config.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Backoff policy for failed polls.
    pub retry: RetryConfig,
    /// Long-poll window passed to each list query.
    pub wait_time: Duration,
    /// Staleness tolerated on source reads.
    pub max_stale: Option<Duration>,
    /// Publish one fresh view per dependency, then finish.
    pub once: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            wait_time: LONG_POLL_WAIT,
            max_stale: None,
            once: false,
        }
    }
}

struct Dependency {
    source: String,
    datacenter: String,
    view: Arc<View>,
}

/// Fan-in of per-dependency pollers.
pub struct Watcher {
    client: Arc<dyn KvClient>,
    config: WatcherConfig,
    dependencies: Vec<Dependency>,
    registered: HashSet<String>,
    data_tx: mpsc::Sender<Arc<View>>,
    data_rx: Option<mpsc::Receiver<Arc<View>>>,
    err_tx: mpsc::Sender<ReplicationError>,
    err_rx: Option<mpsc::Receiver<ReplicationError>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Watcher {
    /// Create a watcher with no dependencies registered.
    pub fn new(client: Arc<dyn KvClient>, config: WatcherConfig) -> Self {
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            client,
            config,
            dependencies: Vec::new(),
            registered: HashSet::new(),
            data_tx,
            data_rx: Some(data_rx),
            err_tx,
            err_rx: Some(err_rx),
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Register a prefix to watch, returning its view.
    ///
    /// Registering the same `source@datacenter` twice returns the existing
    /// view rather than spawning a second poller.
    pub fn watch(&mut self, prefix: &PrefixConfig) -> Arc<View> {
        let id = prefix.dependency_id();
        if self.registered.contains(&id) {
            let existing = self
                .dependencies
                .iter()
                .find(|d| d.view.dependency_id() == id)
                .expect("registered dependency present");
            return Arc::clone(&existing.view);
        }

        let view = Arc::new(View::new(id.clone()));
        self.registered.insert(id);
        self.dependencies.push(Dependency {
            source: prefix.source.clone(),
            datacenter: prefix.datacenter.clone(),
            view: Arc::clone(&view),
        });
        view
    }

    /// Number of registered dependencies.
    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Take the receiving end of the data channel. Single consumer.
    pub fn take_data_rx(&mut self) -> Option<mpsc::Receiver<Arc<View>>> {
        self.data_rx.take()
    }

    /// Take the receiving end of the error channel. Single consumer.
    pub fn take_err_rx(&mut self) -> Option<mpsc::Receiver<ReplicationError>> {
        self.err_rx.take()
    }

    /// Spawn one poller task per registered dependency.
    pub fn start(&mut self) {
        info!(
            dependencies = self.dependencies.len(),
            once = self.config.once,
            "starting watcher"
        );
        for dep in &self.dependencies {
            let span = tracing::info_span!("poller", dependency = %dep.view.dependency_id());
            let handle = tokio::spawn(
                run_poller(
                    Arc::clone(&self.client),
                    Arc::clone(&dep.view),
                    dep.source.clone(),
                    dep.datacenter.clone(),
                    self.config.clone(),
                    self.data_tx.clone(),
                    self.err_tx.clone(),
                    self.shutdown_rx.clone(),
                )
                .instrument(span),
            );
            self.handles.push(handle);
        }
    }

    /// Signal shutdown and wait for every poller to return.
    ///
    /// In-flight long-polls are cancelled, so this returns promptly.
    pub async fn stop(&mut self) {
        debug!("stopping watcher");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "poller task panicked during stop");
            }
        }
        info!("watcher stopped");
    }
}

/// Poll loop for a single dependency.
#[allow(clippy::too_many_arguments)]
async fn run_poller(
    client: Arc<dyn KvClient>,
    view: Arc<View>,
    source: String,
    datacenter: String,
    config: WatcherConfig,
    data_tx: mpsc::Sender<Arc<View>>,
    err_tx: mpsc::Sender<ReplicationError>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let dependency = view.dependency_id().to_string();
    let mut failures: usize = 0;

    info!("poller starting");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let wait_index = view.last_index().await;
        let list_fut = client.list(
            &source,
            ListOptions {
                datacenter: datacenter.clone(),
                wait_index,
                wait_time: config.wait_time,
                max_stale: config.max_stale,
            },
        );
        tokio::pin!(list_fut);

        // Wait for the long-poll, watching for shutdown. On stop the
        // in-flight request is cancelled by dropping it; the server-side
        // wait_time bounds whatever the transport cannot abort.
        let result = loop {
            tokio::select! {
                res = &mut list_fut => break Some(res),
                changed = shutdown_rx.changed() => {
                    // A closed shutdown channel means the watcher is gone.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break None;
                    }
                }
            }
        };
        let Some(result) = result else {
            break;
        };

        match result {
            Ok(resp) => {
                failures = 0;
                metrics::record_poll(&dependency, true);

                if resp.index == wait_index {
                    trace!(index = resp.index, "index unchanged, suppressing");
                    continue;
                }

                debug!(
                    index = resp.index,
                    pairs = resp.pairs.len(),
                    "received data"
                );
                view.advance(resp.pairs, resp.index).await;
                metrics::record_view_published(&dependency);

                if data_tx.send(Arc::clone(&view)).await.is_err() {
                    debug!("data channel closed, poller exiting");
                    break;
                }

                if config.once {
                    debug!("first view published, once mode complete");
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                metrics::record_poll(&dependency, false);

                if config.retry.exhausted(failures) {
                    warn!(failures, error = %e, "retries exhausted, giving up");
                    metrics::record_watcher_terminal(&dependency);
                    let _ = err_tx
                        .send(ReplicationError::WatcherTerminal {
                            dependency: dependency.clone(),
                            attempts: failures,
                            message: e.to_string(),
                        })
                        .await;
                    break;
                }

                let delay = config.retry.delay_for_attempt(failures);
                warn!(
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "poll failed, backing off"
                );
                metrics::record_poll_backoff(&dependency, delay);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }

    info!("poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{BoxFuture, InMemoryKv, KeyPair, KeyUpdate, KvError, ListResponse};

    fn test_config() -> WatcherConfig {
        WatcherConfig {
            retry: RetryConfig::testing(),
            wait_time: Duration::from_millis(50),
            max_stale: None,
            once: false,
        }
    }

    fn prefix(s: &str) -> PrefixConfig {
        PrefixConfig::parse(s).unwrap()
    }

    /// A client whose list queries always fail.
    struct FailingKv;

    impl KvClient for FailingKv {
        fn list(&self, _prefix: &str, _options: ListOptions) -> BoxFuture<'_, ListResponse> {
            Box::pin(async { Err(KvError::new("kv.list", "connection refused")) })
        }
        fn get(&self, _key: &str) -> BoxFuture<'_, Option<KeyPair>> {
            Box::pin(async { Ok(None) })
        }
        fn put(&self, _update: KeyUpdate) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn delete(&self, _key: &str) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn list_keys(&self, _prefix: &str) -> BoxFuture<'_, Vec<String>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn agent_datacenter(&self) -> BoxFuture<'_, String> {
            Box::pin(async { Ok("dc2".to_string()) })
        }
    }

    #[test]
    fn test_watch_deduplicates_dependencies() {
        let kv = Arc::new(InMemoryKv::new("dc2"));
        let mut watcher = Watcher::new(kv, test_config());

        let a = watcher.watch(&prefix("global@dc1:backup"));
        let b = watcher.watch(&prefix("global@dc1:elsewhere"));
        let c = watcher.watch(&prefix("apps@dc1"));

        // Same source@dc -> same dependency, even with another destination.
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(watcher.dependency_count(), 2);
    }

    #[tokio::test]
    async fn test_poller_publishes_fresh_views() {
        let kv = Arc::new(InMemoryKv::new("dc2"));
        kv.seed("dc1", "global/1", "one");

        let mut watcher = Watcher::new(Arc::clone(&kv) as Arc<dyn KvClient>, test_config());
        watcher.watch(&prefix("global@dc1"));
        let mut data_rx = watcher.take_data_rx().unwrap();
        watcher.start();

        // Initial observation.
        let view = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
            .await
            .expect("timed out waiting for first view")
            .unwrap();
        let snap = view.snapshot().await.unwrap();
        assert_eq!(snap.pairs.len(), 1);
        assert_eq!(snap.pairs[0].path, "global/1");

        // A new write triggers a second publication.
        kv.seed("dc1", "global/2", "two");
        let view = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
            .await
            .expect("timed out waiting for second view")
            .unwrap();
        let snap = view.snapshot().await.unwrap();
        assert_eq!(snap.pairs.len(), 2);

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_poller_suppresses_unchanged_index() {
        let kv = Arc::new(InMemoryKv::new("dc2"));
        kv.seed("dc1", "global/1", "one");

        let mut watcher = Watcher::new(Arc::clone(&kv) as Arc<dyn KvClient>, test_config());
        watcher.watch(&prefix("global@dc1"));
        let mut data_rx = watcher.take_data_rx().unwrap();
        watcher.start();

        let _ = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
            .await
            .expect("timed out waiting for first view");

        // The short wait_time means several polls complete while the
        // source stays untouched; none of them may publish.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            data_rx.try_recv().is_err(),
            "unchanged index must not be re-published"
        );

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_once_mode_pollers_finish_after_first_view() {
        let kv = Arc::new(InMemoryKv::new("dc2"));
        kv.seed("dc1", "global/1", "one");
        kv.seed("dc1", "apps/1", "one");

        let mut config = test_config();
        config.once = true;
        let mut watcher = Watcher::new(Arc::clone(&kv) as Arc<dyn KvClient>, config);
        watcher.watch(&prefix("global@dc1"));
        watcher.watch(&prefix("apps@dc1"));
        let mut data_rx = watcher.take_data_rx().unwrap();
        watcher.start();

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
                .await
                .expect("timed out waiting for once-mode views")
                .unwrap();
        }

        // Both pollers have returned on their own; stop() just joins.
        tokio::time::timeout(Duration::from_secs(2), watcher.stop())
            .await
            .expect("stop should not block in once mode");
    }

    #[tokio::test]
    async fn test_exhausted_retries_emit_terminal_error() {
        let mut watcher = Watcher::new(Arc::new(FailingKv), test_config());
        watcher.watch(&prefix("global@dc1"));
        let mut err_rx = watcher.take_err_rx().unwrap();
        watcher.start();

        let err = tokio::time::timeout(Duration::from_secs(2), err_rx.recv())
            .await
            .expect("timed out waiting for terminal error")
            .unwrap();

        match err {
            ReplicationError::WatcherTerminal {
                dependency,
                attempts,
                ..
            } => {
                assert_eq!(dependency, "kv.list(global@dc1)");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected WatcherTerminal, got {other}"),
        }

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_inflight_poll() {
        let kv = Arc::new(InMemoryKv::new("dc2"));
        kv.seed("dc1", "global/1", "one");

        // A long poll window far beyond the test budget: stop must not
        // ride it out.
        let mut config = test_config();
        config.wait_time = Duration::from_secs(30);
        let mut watcher = Watcher::new(Arc::clone(&kv) as Arc<dyn KvClient>, config);
        watcher.watch(&prefix("global@dc1"));
        let mut data_rx = watcher.take_data_rx().unwrap();
        watcher.start();

        // Let the poller publish once and settle into a long poll.
        let _ = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
            .await
            .expect("timed out waiting for first view");
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), watcher.stop())
            .await
            .expect("stop should cancel the in-flight poll promptly");
    }
}
