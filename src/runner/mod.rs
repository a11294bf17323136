// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Runner: the replication event loop.
//!
//! The runner ties the pieces together:
//! 1. Registers one watch dependency per configured prefix
//! 2. Stores published views in a shared map as data arrives
//! 3. Waits for quiescence (or runs immediately when the gate is disabled)
//! 4. Fans out one replicator per prefix, in parallel, and collects results
//! 5. Surfaces terminal errors; handles once-mode termination
//!
//! # Error policy
//!
//! In daemon mode a failed run is logged and retried on the next tick -
//! the checkpoint only advances past successful writes, so nothing is
//! lost. Two exceptions are terminal: the self-replication guard (a
//! misconfiguration that will never succeed) and a watcher that exhausted
//! its retries. In once mode any run error is terminal.
//!
//! # Shutdown
//!
//! [`Runner::stop()`] flips the shutdown signal and joins the loop; a run
//! already in flight completes first, then the watcher is torn down.

mod types;

pub use types::{DependencyHealth, RunnerHealth, RunnerState};

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::exclude::ExcludeFilter;
use crate::kv::KvClient;
use crate::metrics;
use crate::quiescence::QuiescenceGate;
use crate::replicator::replicate;
use crate::status::StatusStore;
use crate::view::View;
use crate::watcher::{Watcher, WatcherConfig, LONG_POLL_WAIT};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared map of dependency id to its latest view.
type ViewMap = Arc<RwLock<HashMap<String, Arc<View>>>>;

/// The replication runner.
///
/// # Lifecycle
///
/// ```rust,no_run
/// use consul_replicate::{ReplicationConfig, Runner};
/// use consul_replicate::kv::InMemoryKv;
/// use std::sync::Arc;
///
/// # async fn example() -> consul_replicate::Result<()> {
/// let config = ReplicationConfig::for_testing("global@dc1:backup");
/// let client = Arc::new(InMemoryKv::new("dc2"));
///
/// let mut runner = Runner::new(config, client, true)?;
/// runner.start().await?;
/// runner.wait().await?; // once mode: resolves after the single run
/// # Ok(())
/// # }
/// ```
pub struct Runner {
    config: ReplicationConfig,
    client: Arc<dyn KvClient>,
    once: bool,
    state_tx: watch::Sender<RunnerState>,
    state_rx: watch::Receiver<RunnerState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    views: ViewMap,
    loop_handle: Option<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("once", &self.once)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Create a runner from a finalized configuration.
    ///
    /// Validates the configuration; an invalid prefix or empty prefix list
    /// is fatal here, before anything is spawned.
    pub fn new(
        mut config: ReplicationConfig,
        client: Arc<dyn KvClient>,
        once: bool,
    ) -> Result<Self> {
        config.finalize()?;
        info!(
            prefixes = config.prefixes.len(),
            excludes = config.excludes.len(),
            once,
            "creating runner"
        );

        let (state_tx, state_rx) = watch::channel(RunnerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            client,
            once,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            views: Arc::new(RwLock::new(HashMap::new())),
            loop_handle: None,
        })
    }

    /// Current runner state.
    pub fn state(&self) -> RunnerState {
        *self.state_rx.borrow()
    }

    /// A receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<RunnerState> {
        self.state_rx.clone()
    }

    /// Whether the runner loop is live.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), RunnerState::Running | RunnerState::Draining)
    }

    /// Whether the runner was created in once mode.
    pub fn is_once(&self) -> bool {
        self.once
    }

    /// Collect health status for monitoring endpoints.
    ///
    /// Performs no network I/O: everything comes from the state channel
    /// and the cached views map. The daemon serves this from its health
    /// endpoint and registers the check with the local agent.
    pub async fn health_check(&self) -> RunnerHealth {
        let state = self.state();
        let ready = matches!(state, RunnerState::Running | RunnerState::Draining);

        let views = self.views.read().await;
        let mut dependencies = Vec::with_capacity(views.len());
        let mut dependencies_with_data = 0;
        for view in views.values() {
            let snapshot = view.snapshot().await;
            let has_data = snapshot.is_some();
            if has_data {
                dependencies_with_data += 1;
            }
            dependencies.push(DependencyHealth {
                dependency_id: view.dependency_id().to_string(),
                has_data,
                last_index: snapshot.map(|s| s.last_index).unwrap_or(0),
            });
        }
        dependencies.sort_by(|a, b| a.dependency_id.cmp(&b.dependency_id));

        // The views map only holds dependencies that have published at
        // least once; the configured prefixes are the full set.
        let dependencies_total = self
            .config
            .prefixes
            .iter()
            .map(|p| p.dependency_id())
            .collect::<std::collections::HashSet<_>>()
            .len();

        RunnerHealth {
            state,
            ready,
            healthy: ready && dependencies_with_data == dependencies_total,
            dependencies_total,
            dependencies_with_data,
            dependencies,
        }
    }

    /// Start the watcher and the event loop.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != RunnerState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(once = self.once, "starting runner");

        let mut watcher = Watcher::new(
            Arc::clone(&self.client),
            WatcherConfig {
                retry: self.config.consul.retry.clone(),
                wait_time: LONG_POLL_WAIT,
                max_stale: self.config.max_stale_duration(),
                once: self.once,
            },
        );
        for prefix in &self.config.prefixes {
            let view = watcher.watch(prefix);
            debug!(dependency = %view.dependency_id(), "registered dependency");
        }

        let data_rx = watcher
            .take_data_rx()
            .ok_or_else(|| ReplicationError::Internal("data channel already taken".to_string()))?;
        let err_rx = watcher
            .take_err_rx()
            .ok_or_else(|| ReplicationError::Internal("error channel already taken".to_string()))?;

        watcher.start();

        let ctx = RunContext {
            config: self.config.clone(),
            client: Arc::clone(&self.client),
            statuses: StatusStore::new(Arc::clone(&self.client), &self.config.status_dir),
            excludes: ExcludeFilter::new(&self.config.excludes),
            views: Arc::clone(&self.views),
            dependency_count: watcher.dependency_count(),
            once: self.once,
        };

        let _ = self.state_tx.send(RunnerState::Running);
        metrics::set_runner_state("Running");

        let state_tx = self.state_tx.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        self.loop_handle = Some(tokio::spawn(run_loop(
            ctx, watcher, data_rx, err_rx, shutdown_rx, state_tx,
        )));

        Ok(())
    }

    /// Wait for the event loop to finish.
    ///
    /// Resolves on once-mode completion, after [`stop()`](Self::stop), or
    /// with the terminal error that ended the loop.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.loop_handle.take() else {
            return Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(ReplicationError::Internal(format!(
                "runner loop panicked: {e}"
            ))),
        }
    }

    /// Stop the runner: signal shutdown, let a pending run finish, tear
    /// down the watcher.
    pub async fn stop(&mut self) {
        info!("stopping runner");
        let _ = self.state_tx.send(RunnerState::ShuttingDown);
        metrics::set_runner_state("ShuttingDown");
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.loop_handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "runner loop exited with error during stop"),
                Err(e) => warn!(error = %e, "runner loop panicked during stop"),
            }
        }

        let _ = self.state_tx.send(RunnerState::Stopped);
        metrics::set_runner_state("Stopped");
        info!("runner stopped");
    }
}

/// Everything a run needs, bundled for the loop task.
struct RunContext {
    config: ReplicationConfig,
    client: Arc<dyn KvClient>,
    statuses: StatusStore,
    excludes: ExcludeFilter,
    views: ViewMap,
    dependency_count: usize,
    once: bool,
}

/// Event loop body. Owns the watcher so it can tear it down on exit.
async fn run_loop(
    ctx: RunContext,
    mut watcher: Watcher,
    mut data_rx: mpsc::Receiver<Arc<View>>,
    mut err_rx: mpsc::Receiver<ReplicationError>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<RunnerState>,
) -> Result<()> {
    let result = run_loop_inner(&ctx, &mut data_rx, &mut err_rx, &mut shutdown_rx, &state_tx).await;

    watcher.stop().await;

    match &result {
        Ok(()) => {
            let _ = state_tx.send(RunnerState::Stopped);
            metrics::set_runner_state("Stopped");
        }
        Err(e) => {
            error!(error = %e, "runner loop terminating with error");
            let _ = state_tx.send(RunnerState::Failed);
            metrics::set_runner_state("Failed");
        }
    }

    result
}

async fn run_loop_inner(
    ctx: &RunContext,
    data_rx: &mut mpsc::Receiver<Arc<View>>,
    err_rx: &mut mpsc::Receiver<ReplicationError>,
    shutdown_rx: &mut watch::Receiver<bool>,
    state_tx: &watch::Sender<RunnerState>,
) -> Result<()> {
    if ctx.once {
        // Wait for every dependency's first view, then run exactly once.
        let mut received = 0;
        while received < ctx.dependency_count {
            tokio::select! {
                maybe = data_rx.recv() => match maybe {
                    Some(view) => {
                        receive(ctx, view).await;
                        received += 1;
                    }
                    None => {
                        return Err(ReplicationError::Internal(
                            "data channel closed before all views arrived".to_string(),
                        ))
                    }
                },
                maybe = err_rx.recv() => {
                    if let Some(err) = maybe {
                        return Err(err);
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("received stop before initial views");
                        return Ok(());
                    }
                }
            }
        }

        info!(views = received, "all views received, running once");
        let _ = state_tx.send(RunnerState::Draining);
        let outcome = run_all(ctx).await;
        let _ = state_tx.send(RunnerState::Running);
        outcome?;
        info!("run finished and once is set, exiting");
        return Ok(());
    }

    let wait = &ctx.config.wait;
    let mut gate = QuiescenceGate::new(wait.min_duration(), wait.max_duration());

    loop {
        let deadline = gate.next_deadline().map(tokio::time::Instant::from_std);

        tokio::select! {
            maybe = data_rx.recv() => {
                match maybe {
                    Some(view) => {
                        receive(ctx, view).await;
                        // Drain every view that already has data queued.
                        while let Ok(view) = data_rx.try_recv() {
                            receive(ctx, view).await;
                        }
                        if gate.is_enabled() {
                            debug!("quiescence timers starting");
                            gate.record(Instant::now());
                            continue;
                        }
                    }
                    None => {
                        return Err(ReplicationError::Internal(
                            "data channel closed".to_string(),
                        ))
                    }
                }
            }
            _ = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600))
            ), if deadline.is_some() => {
                debug!("quiescence gate fired");
                gate.reset();
            }
            maybe = err_rx.recv() => {
                match maybe {
                    Some(err) => {
                        error!(error = %err, "watcher reported terminal error");
                        return Err(err);
                    }
                    None => {
                        return Err(ReplicationError::Internal(
                            "error channel closed".to_string(),
                        ))
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("received stop");
                    return Ok(());
                }
                continue;
            }
        }

        // New data with the gate disabled, or a gate firing: run now.
        let _ = state_tx.send(RunnerState::Draining);
        let outcome = run_all(ctx).await;
        let _ = state_tx.send(RunnerState::Running);

        if let Err(err) = outcome {
            if err.is_self_replication() {
                error!(error = %err, "self-replication detected, terminating");
                return Err(err);
            }
            warn!(error = %err, "run failed, retrying on next tick");
        }
    }
}

/// Store a published view in the shared map.
async fn receive(ctx: &RunContext, view: Arc<View>) {
    let id = view.dependency_id().to_string();
    debug!(dependency = %id, "received view");
    ctx.views.write().await.insert(id, view);
}

/// Fan out one replicator per prefix and collect the results.
async fn run_all(ctx: &RunContext) -> Result<()> {
    let start = Instant::now();
    info!("running");

    let mut handles = Vec::with_capacity(ctx.config.prefixes.len());
    for prefix in &ctx.config.prefixes {
        let snapshot = {
            let views = ctx.views.read().await;
            match views.get(&prefix.dependency_id()) {
                Some(view) => view.snapshot().await,
                None => None,
            }
        };
        handles.push(tokio::spawn(replicate(
            prefix.clone(),
            ctx.excludes.clone(),
            Arc::clone(&ctx.client),
            ctx.statuses.clone(),
            snapshot,
        )));
    }

    let mut errors = Vec::new();
    for joined in join_all(handles).await {
        match joined {
            Ok(Ok(_stats)) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(ReplicationError::Internal(format!(
                "replicator task panicked: {e}"
            ))),
        }
    }

    let success = errors.is_empty();
    metrics::record_run(start.elapsed(), success);

    match ReplicationError::aggregate(errors) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}
