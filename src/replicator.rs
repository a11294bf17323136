//! Per-prefix replication pass.
//!
//! [`replicate`] diffs one observed source subtree against the local
//! datacenter and applies the difference: puts for pairs newer than the
//! checkpoint, deletes for local keys the source no longer has, then a
//! checkpoint write. The runner calls it once per prefix per run, in
//! parallel across prefixes.
//!
//! Order within a run matters and is fixed: updates first, then delete
//! reconciliation, then the checkpoint. Across prefixes there is no
//! ordering.
//!
//! # Failure policy
//!
//! A failed put or delete fails the run for this prefix; the checkpoint is
//! not advanced, so the next run retries the same work (puts are
//! idempotent at a given index). A failed checkpoint write is only logged:
//! re-replicating a few items beats failing the run.

use crate::config::PrefixConfig;
use crate::error::{ReplicationError, Result};
use crate::exclude::ExcludeFilter;
use crate::kv::{KeyUpdate, KvClient, LOCK_FLAG_VALUE, SEMAPHORE_FLAG_VALUE};
use crate::metrics;
use crate::status::StatusStore;
use crate::view::ViewSnapshot;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one replication pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Keys written to the destination.
    pub puts: usize,
    /// Keys deleted from the destination.
    pub deletes: usize,
    /// Source pairs skipped by the exclude filter.
    pub excluded: usize,
    /// Source pairs skipped because they were already replicated.
    pub skipped: usize,
}

/// Replicate one prefix from its observed view into the local datacenter.
///
/// `view` is the snapshot taken by the runner; `None` means the watcher
/// has not yet observed data for this prefix, which is not an error - the
/// pass is simply a no-op.
pub async fn replicate(
    prefix: PrefixConfig,
    excludes: ExcludeFilter,
    client: Arc<dyn KvClient>,
    statuses: StatusStore,
    view: Option<ViewSnapshot>,
) -> Result<RunStats> {
    // Refuse to replicate a datacenter into itself.
    let local_dc = client
        .agent_datacenter()
        .await
        .map_err(|e| ReplicationError::transport("agent.self", e.to_string()))?;
    if local_dc == prefix.datacenter {
        return Err(ReplicationError::SelfReplication {
            datacenter: prefix.datacenter.clone(),
        });
    }

    let mut status = statuses.read(&prefix).await?;

    let Some(view) = view else {
        info!(prefix = %prefix.dependency_id(), "no data yet for prefix");
        return Ok(RunStats::default());
    };

    let mut stats = RunStats::default();
    let mut used_keys: HashSet<String> = HashSet::with_capacity(view.pairs.len());

    // Update keys to the most recent versions.
    for pair in view.pairs.iter() {
        let key = prefix.destination_key(&pair.path);
        used_keys.insert(key.clone());

        if let Some(exclude) = excludes.matches_source(&pair.path) {
            debug!(path = %pair.path, exclude = %exclude, "path excluded");
            stats.excluded += 1;
            continue;
        }

        if pair.modify_index <= status.last_replicated {
            debug!(key = %key, "already replicated, skipping");
            stats.skipped += 1;
            continue;
        }

        if pair.flags == LOCK_FLAG_VALUE {
            warn!(
                key = %key,
                "lock in use at source, but sessions cannot be replicated across datacenters"
            );
        }
        if pair.flags == SEMAPHORE_FLAG_VALUE {
            warn!(
                key = %key,
                "semaphore in use at source, but sessions cannot be replicated across datacenters"
            );
        }
        if !pair.session.is_empty() {
            warn!(
                key = %key,
                "key has attached session, but sessions cannot be replicated across datacenters"
            );
        }

        client
            .put(KeyUpdate {
                key: key.clone(),
                value: pair.value.clone(),
                flags: pair.flags,
            })
            .await
            .map_err(|e| ReplicationError::Write {
                key: key.clone(),
                message: e.to_string(),
            })?;
        debug!(key = %key, "updated key");
        stats.puts += 1;
    }

    // Reconcile deletes: local keys the source no longer carries.
    let local_keys = client
        .list_keys(&prefix.destination)
        .await
        .map_err(|e| ReplicationError::transport("kv.keys", e.to_string()))?;

    for key in local_keys {
        if let Some(exclude) = excludes.matches_destination(&key, &prefix) {
            debug!(key = %key, exclude = %exclude, "key excluded from deletes");
            continue;
        }
        if used_keys.contains(&key) {
            continue;
        }
        client
            .delete(&key)
            .await
            .map_err(|e| ReplicationError::Delete {
                key: key.clone(),
                message: e.to_string(),
            })?;
        debug!(key = %key, "deleted key");
        stats.deletes += 1;
    }

    // Checkpoint. The index never moves backwards, and a failed write is
    // only logged - the next run re-applies idempotently.
    status.last_replicated = status.last_replicated.max(view.last_index);
    status.source = prefix.source.clone();
    status.destination = prefix.destination.clone();
    match statuses.write(&prefix, &status).await {
        Ok(()) => metrics::record_checkpoint(&prefix.source, true),
        Err(e) => {
            warn!(prefix = %prefix.dependency_id(), error = %e, "failed to checkpoint status");
            metrics::record_checkpoint(&prefix.source, false);
        }
    }

    metrics::record_replicated(&prefix.source, stats.puts, stats.deletes);
    metrics::record_excluded(&prefix.source, stats.excluded);

    if stats.puts > 0 || stats.deletes > 0 {
        info!(
            prefix = %prefix.dependency_id(),
            puts = stats.puts,
            deletes = stats.deletes,
            "replicated"
        );
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExcludeConfig;
    use crate::kv::{BoxFuture, InMemoryKv, KeyPair, KvError, ListOptions, ListResponse};
    use crate::view::View;

    const LOCAL_DC: &str = "dc2";
    const SOURCE_DC: &str = "dc1";

    struct Harness {
        kv: Arc<InMemoryKv>,
        statuses: StatusStore,
        prefix: PrefixConfig,
    }

    impl Harness {
        fn new(prefix: &str) -> Self {
            let kv = Arc::new(InMemoryKv::new(LOCAL_DC));
            let statuses = StatusStore::new(
                Arc::clone(&kv) as Arc<dyn KvClient>,
                "service/consul-replicate/statuses",
            );
            Self {
                kv,
                statuses,
                prefix: PrefixConfig::parse(prefix).unwrap(),
            }
        }

        /// Snapshot the source subtree the way a poller would.
        async fn observe(&self) -> Option<ViewSnapshot> {
            let view = View::new(self.prefix.dependency_id());
            let pairs = self.kv.pairs_under(SOURCE_DC, &self.prefix.source);
            view.advance(pairs, self.kv.index_of(SOURCE_DC)).await;
            view.snapshot().await
        }

        async fn run(&self, excludes: &[&str]) -> Result<RunStats> {
            let excludes: Vec<ExcludeConfig> = excludes
                .iter()
                .map(|s| ExcludeConfig::parse(s).unwrap())
                .collect();
            replicate(
                self.prefix.clone(),
                ExcludeFilter::new(&excludes),
                Arc::clone(&self.kv) as Arc<dyn KvClient>,
                self.statuses.clone(),
                self.observe().await,
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_basic_mirror() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/1", "test data");
        h.kv.seed(SOURCE_DC, "global/2", "test data");
        h.kv.seed(SOURCE_DC, "globalization", "test data");

        let stats = h.run(&[]).await.unwrap();
        assert_eq!(stats.puts, 3);
        assert_eq!(stats.deletes, 0);

        assert_eq!(
            h.kv.get_in(LOCAL_DC, "backup/1").unwrap().value,
            b"test data"
        );
        assert!(h.kv.get_in(LOCAL_DC, "backup/2").is_some());
        assert!(h.kv.get_in(LOCAL_DC, "backupization").is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_written_after_run() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/1", "v");

        h.run(&[]).await.unwrap();

        let status = h.statuses.read(&h.prefix).await.unwrap();
        assert_eq!(status.last_replicated, h.kv.index_of(SOURCE_DC));
        assert_eq!(status.source, "global");
        assert_eq!(status.destination, "backup");
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/1", "v");
        h.kv.seed(SOURCE_DC, "global/2", "v");

        let first = h.run(&[]).await.unwrap();
        assert_eq!(first.puts, 2);

        let second = h.run(&[]).await.unwrap();
        assert_eq!(second.puts, 0);
        assert_eq!(second.deletes, 0);
        assert_eq!(second.skipped, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_never_decreases() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/1", "v");
        h.run(&[]).await.unwrap();
        let after_first = h.statuses.read(&h.prefix).await.unwrap().last_replicated;

        // Replay a stale view (index 0); the checkpoint must hold.
        let stale_view = View::new(h.prefix.dependency_id());
        stale_view.advance(Vec::new(), 0).await;
        replicate(
            h.prefix.clone(),
            ExcludeFilter::default(),
            Arc::clone(&h.kv) as Arc<dyn KvClient>,
            h.statuses.clone(),
            stale_view.snapshot().await,
        )
        .await
        .unwrap();

        let after_replay = h.statuses.read(&h.prefix).await.unwrap().last_replicated;
        assert!(after_replay >= after_first);
    }

    #[tokio::test]
    async fn test_self_replication_refused() {
        let h = Harness::new("global@dc2:backup");
        h.kv.seed("dc2", "global/1", "v");

        let err = h.run(&[]).await.unwrap_err();
        assert!(err.is_self_replication());
        // No writes happened.
        assert!(h.kv.get_in(LOCAL_DC, "backup/1").is_none());
    }

    #[tokio::test]
    async fn test_no_view_is_a_noop() {
        let h = Harness::new("global@dc1:backup");
        let stats = replicate(
            h.prefix.clone(),
            ExcludeFilter::default(),
            Arc::clone(&h.kv) as Arc<dyn KvClient>,
            h.statuses.clone(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(stats, RunStats::default());
    }

    #[tokio::test]
    async fn test_excluded_path_not_written() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/4", "v");
        h.kv.seed(SOURCE_DC, "global/5", "v");
        h.kv.seed(SOURCE_DC, "global/5/child", "v");

        let stats = h.run(&["global/5"]).await.unwrap();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.excluded, 2);
        assert!(h.kv.get_in(LOCAL_DC, "backup/4").is_some());
        assert!(h.kv.get_in(LOCAL_DC, "backup/5").is_none());
        assert!(h.kv.get_in(LOCAL_DC, "backup/5/child").is_none());
    }

    #[tokio::test]
    async fn test_excluded_destination_not_deleted() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/1", "v");
        // Pre-existing local state under an excluded subtree.
        h.kv.seed(LOCAL_DC, "backup/5/nodelete", "keep");

        let stats = h.run(&["global/5"]).await.unwrap();
        assert_eq!(stats.deletes, 0);
        assert_eq!(
            h.kv.get_in(LOCAL_DC, "backup/5/nodelete").unwrap().value,
            b"keep"
        );
    }

    #[tokio::test]
    async fn test_stale_destination_keys_deleted() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/1", "v");
        h.kv.seed(LOCAL_DC, "backup/stale", "x");

        let stats = h.run(&[]).await.unwrap();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.deletes, 1);
        assert!(h.kv.get_in(LOCAL_DC, "backup/stale").is_none());
        assert!(h.kv.get_in(LOCAL_DC, "backup/1").is_some());
    }

    #[tokio::test]
    async fn test_destination_converges_to_source_set() {
        let h = Harness::new("global@dc1:backup");
        for i in 0..5 {
            h.kv.seed(SOURCE_DC, &format!("global/{i}"), "v");
        }
        h.kv.seed(LOCAL_DC, "backup/doomed", "x");
        h.run(&[]).await.unwrap();

        // Source shrinks; destination follows.
        h.kv.remove(SOURCE_DC, "global/3");
        h.run(&[]).await.unwrap();

        let keys: Vec<String> = h
            .kv.pairs_under(LOCAL_DC, "backup")
            .into_iter()
            .map(|p| p.path)
            .collect();
        assert_eq!(
            keys,
            vec!["backup/0", "backup/1", "backup/2", "backup/4"]
        );
    }

    #[tokio::test]
    async fn test_flags_preserved_session_dropped() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed_with(SOURCE_DC, "global/held", "v", 99, "session-abc");

        h.run(&[]).await.unwrap();

        let pair = h.kv.get_in(LOCAL_DC, "backup/held").unwrap();
        assert_eq!(pair.flags, 99);
        assert_eq!(pair.session, "");
    }

    #[tokio::test]
    async fn test_lock_flagged_key_still_replicated() {
        let h = Harness::new("global@dc1:backup");
        h.kv
            .seed_with(SOURCE_DC, "global/lock", "v", LOCK_FLAG_VALUE, "s");
        h.kv
            .seed_with(SOURCE_DC, "global/sem", "v", SEMAPHORE_FLAG_VALUE, "");

        let stats = h.run(&[]).await.unwrap();
        assert_eq!(stats.puts, 2);
        assert_eq!(
            h.kv.get_in(LOCAL_DC, "backup/lock").unwrap().flags,
            LOCK_FLAG_VALUE
        );
        assert_eq!(
            h.kv.get_in(LOCAL_DC, "backup/sem").unwrap().flags,
            SEMAPHORE_FLAG_VALUE
        );
    }

    /// Wraps the in-memory store, failing puts for chosen keys.
    struct FailingPuts {
        inner: Arc<InMemoryKv>,
        fail_keys: HashSet<String>,
    }

    impl KvClient for FailingPuts {
        fn list(&self, prefix: &str, options: ListOptions) -> BoxFuture<'_, ListResponse> {
            self.inner.list(prefix, options)
        }
        fn get(&self, key: &str) -> BoxFuture<'_, Option<KeyPair>> {
            self.inner.get(key)
        }
        fn put(&self, update: KeyUpdate) -> BoxFuture<'_, ()> {
            if self.fail_keys.contains(&update.key) {
                return Box::pin(async { Err(KvError::new("kv.put", "injected failure")) });
            }
            self.inner.put(update)
        }
        fn delete(&self, key: &str) -> BoxFuture<'_, ()> {
            self.inner.delete(key)
        }
        fn list_keys(&self, prefix: &str) -> BoxFuture<'_, Vec<String>> {
            self.inner.list_keys(prefix)
        }
        fn agent_datacenter(&self) -> BoxFuture<'_, String> {
            self.inner.agent_datacenter()
        }
    }

    #[tokio::test]
    async fn test_write_failure_fails_run_and_preserves_checkpoint() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/1", "v");

        let client = Arc::new(FailingPuts {
            inner: Arc::clone(&h.kv),
            fail_keys: HashSet::from(["backup/1".to_string()]),
        });
        let statuses = StatusStore::new(
            Arc::clone(&client) as Arc<dyn KvClient>,
            "service/consul-replicate/statuses",
        );

        let err = replicate(
            h.prefix.clone(),
            ExcludeFilter::default(),
            client.clone() as Arc<dyn KvClient>,
            statuses.clone(),
            h.observe().await,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ReplicationError::Write { .. }));
        // The checkpoint was not advanced, so the next run retries.
        assert_eq!(statuses.read(&h.prefix).await.unwrap().last_replicated, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_not_fatal() {
        let h = Harness::new("global@dc1:backup");
        h.kv.seed(SOURCE_DC, "global/1", "v");

        let statuses_for_path = StatusStore::new(
            Arc::clone(&h.kv) as Arc<dyn KvClient>,
            "service/consul-replicate/statuses",
        );
        let status_path = statuses_for_path.path(&h.prefix);

        let client = Arc::new(FailingPuts {
            inner: Arc::clone(&h.kv),
            fail_keys: HashSet::from([status_path]),
        });
        let statuses = StatusStore::new(
            Arc::clone(&client) as Arc<dyn KvClient>,
            "service/consul-replicate/statuses",
        );

        let stats = replicate(
            h.prefix.clone(),
            ExcludeFilter::default(),
            client.clone() as Arc<dyn KvClient>,
            statuses,
            h.observe().await,
        )
        .await
        .unwrap();

        // The data write landed even though the checkpoint did not.
        assert_eq!(stats.puts, 1);
        assert!(h.kv.get_in(LOCAL_DC, "backup/1").is_some());
    }
}
