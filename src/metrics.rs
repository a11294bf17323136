//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Poll activity and watcher errors per dependency
//! - Views published (fresh data observed)
//! - Run frequency and duration
//! - Keys replicated, deleted, and excluded per prefix
//! - Checkpoint writes
//! - Runner state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicate_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed source poll.
pub fn record_poll(dependency: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicate_polls_total", "dependency" => dependency.to_string(), "status" => status)
        .increment(1);
}

/// Record the backoff delay chosen after a failed poll.
pub fn record_poll_backoff(dependency: &str, delay: Duration) {
    histogram!("replicate_poll_backoff_seconds", "dependency" => dependency.to_string())
        .record(delay.as_secs_f64());
}

/// Record a fresh view published by a poller.
pub fn record_view_published(dependency: &str) {
    counter!("replicate_views_published_total", "dependency" => dependency.to_string())
        .increment(1);
}

/// Record a poller giving up after exhausting its retries.
pub fn record_watcher_terminal(dependency: &str) {
    counter!("replicate_watcher_terminal_total", "dependency" => dependency.to_string())
        .increment(1);
}

/// Record one run across all prefixes.
pub fn record_run(duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicate_runs_total", "status" => status).increment(1);
    histogram!("replicate_run_duration_seconds").record(duration.as_secs_f64());
}

/// Record the keys touched by one prefix's replication pass.
pub fn record_replicated(source: &str, puts: usize, deletes: usize) {
    counter!("replicate_keys_replicated_total", "prefix" => source.to_string())
        .increment(puts as u64);
    counter!("replicate_keys_deleted_total", "prefix" => source.to_string())
        .increment(deletes as u64);
}

/// Record keys skipped by the exclude filter.
pub fn record_excluded(source: &str, count: usize) {
    if count > 0 {
        counter!("replicate_keys_excluded_total", "prefix" => source.to_string())
            .increment(count as u64);
    }
}

/// Record a checkpoint write attempt.
pub fn record_checkpoint(source: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicate_checkpoint_writes_total", "prefix" => source.to_string(), "status" => status)
        .increment(1);
}

/// Record the runner's lifecycle state.
pub fn set_runner_state(state: &str) {
    gauge!("replicate_runner_state", "state" => state.to_string()).set(1.0);
}
