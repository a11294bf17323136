// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication daemon core.
//!
//! Errors are categorized by where they occur (configuration, polling,
//! destination writes, checkpointing) and carry enough context to tell an
//! operator which prefix or key was involved.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Network or server error while polling the source |
//! | `Config` | No | Invalid prefix declaration, missing required field |
//! | `SelfReplication` | No | Destination datacenter equals source datacenter |
//! | `WatcherTerminal` | No | Poller exhausted its retry budget |
//! | `Write` / `Delete` | No* | Destination put/delete failed; the next run retries |
//! | `Checkpoint` | No* | Status record write failed; next run re-applies |
//! | `Decode` | No | Malformed status document (treated as fresh state) |
//! | `InvalidState` | No | Runner lifecycle violation |
//! | `Shutdown` | No | Operation attempted during shutdown |
//! | `Internal` | No | Unexpected internal error |
//!
//! (*) not retried in place: the checkpoint only advances after successful
//! writes, so the following run replays the work idempotently.
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to determine if an operation
//! should be retried with backoff. Only transport errors qualify; the
//! watcher retries them with bounded exponential backoff and everything
//! else surfaces to the runner.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid or missing configuration.
    ///
    /// Occurs when a prefix declaration fails to parse or a required field is
    /// absent. Not retryable - fix the configuration and restart.
    #[error("config error: {0}")]
    Config(String),

    /// The prefix's source datacenter is the local datacenter.
    ///
    /// Replicating a datacenter into itself would loop forever; the
    /// replicator refuses before issuing any writes.
    #[error("local datacenter cannot be the source datacenter ({datacenter})")]
    SelfReplication {
        /// The offending datacenter label.
        datacenter: String,
    },

    /// Network or server error talking to the KV store.
    ///
    /// Retryable: the watcher backs off and polls again.
    #[error("transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
    },

    /// A poller exhausted its retry budget.
    ///
    /// Fatal to the runner: the view for this dependency can no longer be
    /// kept fresh.
    #[error("watcher terminal for {dependency} after {attempts} attempts: {message}")]
    WatcherTerminal {
        dependency: String,
        attempts: usize,
        message: String,
    },

    /// A put to the destination KV failed.
    ///
    /// Fails the current run; the checkpoint is not advanced, so the next
    /// run retries the same updates.
    #[error("failed to write {key:?}: {message}")]
    Write { key: String, message: String },

    /// A delete at the destination KV failed.
    #[error("failed to delete {key:?}: {message}")]
    Delete { key: String, message: String },

    /// Failed to persist a status record.
    ///
    /// Logged at WARN and otherwise ignored: the next run re-replicates
    /// some items, which is safe because puts are idempotent.
    #[error("failed to checkpoint status: {0}")]
    Checkpoint(String),

    /// Malformed status document.
    ///
    /// Treated as a missing status (fresh start / full resync).
    #[error("failed to decode status: {0}")]
    Decode(String),

    /// Runner lifecycle violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g. calling `start()` twice). Indicates a bug in the caller.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Several run errors collected from the per-prefix fan-out.
    #[error("{} replication error(s): {}", .0.len(), format_aggregate(.0))]
    Aggregate(Vec<ReplicationError>),
}

fn format_aggregate(errs: &[ReplicationError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReplicationError {
    /// Create a transport error with operation context.
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Check whether this error (or any aggregated member) is the
    /// self-replication guard, which is fatal to the runner even in
    /// daemon mode.
    pub fn is_self_replication(&self) -> bool {
        match self {
            Self::SelfReplication { .. } => true,
            Self::Aggregate(errs) => errs.iter().any(|e| e.is_self_replication()),
            _ => false,
        }
    }

    /// Collapse a list of run errors into a single error, if any.
    pub fn aggregate(errs: Vec<ReplicationError>) -> Option<ReplicationError> {
        match errs.len() {
            0 => None,
            1 => errs.into_iter().next(),
            _ => Some(ReplicationError::Aggregate(errs)),
        }
    }
}
