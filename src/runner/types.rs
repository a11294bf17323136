//! Runner state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ────────────────────→ Running ──────────┐
//!    │                            │  ↑            │ (watcher terminal /
//!    │ stop()                     │  │            │  self-replication)
//!    ↓                  (run begins) (run ends)   ↓
//! Stopped                         ↓  │         Failed
//!    ↑                          Draining
//!    │          stop()            │
//!    └──────── ShuttingDown ←─────┘
//! ```
//!
//! - **Created**: constructed, nothing spawned yet.
//! - **Running**: pollers live, waiting for data or quiescence.
//! - **Draining**: replicators are mid-run; stop waits for them.
//! - **ShuttingDown**: stop requested, watcher being torn down.
//! - **Stopped**: clean exit (also the once-mode success terminal).
//! - **Failed**: terminal error surfaced; check the `wait()` result.

/// State of the runner.
///
/// See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Runner created but not started.
    Created,
    /// Watching for data and quiescence.
    Running,
    /// Replicators are executing a run.
    Draining,
    /// Stop requested; tearing down.
    ShuttingDown,
    /// Shut down cleanly.
    Stopped,
    /// Terminal error; the runner cannot continue.
    Failed,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Created => write!(f, "Created"),
            RunnerState::Running => write!(f, "Running"),
            RunnerState::Draining => write!(f, "Draining"),
            RunnerState::ShuttingDown => write!(f, "ShuttingDown"),
            RunnerState::Stopped => write!(f, "Stopped"),
            RunnerState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health of a single watch dependency.
#[derive(Debug, Clone)]
pub struct DependencyHealth {
    /// Dependency identifier (`kv.list(<source>@<dc>)`).
    pub dependency_id: String,
    /// Whether the poller has observed data at least once.
    pub has_data: bool,
    /// Store index of the last observation (0 before any data).
    pub last_index: u64,
}

/// Snapshot of runner health for monitoring endpoints.
///
/// Collected entirely from cached internal state - no network I/O. The
/// daemon typically maps `ready` to a readiness probe and serializes the
/// whole struct on its diagnostics endpoint.
#[derive(Debug, Clone)]
pub struct RunnerHealth {
    /// Current lifecycle state.
    pub state: RunnerState,
    /// The event loop is live (running or mid-run).
    pub ready: bool,
    /// Ready and every dependency has produced at least one view.
    pub healthy: bool,
    /// Number of registered watch dependencies.
    pub dependencies_total: usize,
    /// How many of them have observed data.
    pub dependencies_with_data: usize,
    /// Per-dependency detail.
    pub dependencies: Vec<DependencyHealth>,
}
