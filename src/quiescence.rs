//! Quiescence gate: a dual-timer debouncer for run scheduling.
//!
//! Bulk imports in the source datacenter arrive as a burst of data events.
//! Running the replicators once per event would amplify every source write
//! into a destination write storm, so the runner waits for the source to
//! go quiet before running:
//!
//! - each data event re-arms a `min` deadline (run no sooner than `min`
//!   after the last event);
//! - the first event of a burst arms a `max` deadline once (run no later
//!   than `max` after the burst began), so a source that never goes quiet
//!   cannot starve the destination.
//!
//! The gate fires at whichever deadline comes first. A zero `min` or `max`
//! disables the gate entirely and the runner runs immediately on data.
//!
//! The gate is pure state over [`Instant`]s; the runner owns the actual
//! sleeping.

use std::time::{Duration, Instant};

/// Dual-deadline debouncer.
#[derive(Debug)]
pub struct QuiescenceGate {
    min: Duration,
    max: Duration,
    min_deadline: Option<Instant>,
    max_deadline: Option<Instant>,
}

impl QuiescenceGate {
    /// Create a gate with the given bounds. Zero on either side disables
    /// the gate.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            min_deadline: None,
            max_deadline: None,
        }
    }

    /// Whether debouncing is active at all.
    pub fn is_enabled(&self) -> bool {
        !self.min.is_zero() && !self.max.is_zero()
    }

    /// Whether the gate is currently holding a pending run.
    pub fn is_armed(&self) -> bool {
        self.min_deadline.is_some()
    }

    /// Record a data event at `now`.
    ///
    /// Resets the `min` deadline; arms the `max` deadline only if this is
    /// the first event since the gate last fired. No-op when disabled.
    pub fn record(&mut self, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        self.min_deadline = Some(now + self.min);
        self.max_deadline.get_or_insert(now + self.max);
    }

    /// The instant the gate should fire, if armed: the earlier of the two
    /// deadlines.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.min_deadline, self.max_deadline) {
            (Some(min), Some(max)) => Some(min.min(max)),
            (Some(min), None) => Some(min),
            _ => None,
        }
    }

    /// Clear both deadlines after the gate fires.
    pub fn reset(&mut self) {
        self.min_deadline = None;
        self.max_deadline = None;
    }
}
