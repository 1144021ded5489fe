//! Run tracking.
//!
//! Global mutable state (telemetry client, logger) is lifted into a
//! context object handed to the engine; tests and `--no-tracking` runs use
//! the no-op implementation. The log tracker reports run lifecycle events
//! through `tracing` only — nothing leaves the process.

use crate::engine::Algorithm;
use crate::error::DiffError;
use crate::stream::DiffStats;

/// Run lifecycle observer.
pub trait Tracker: Send + Sync {
    fn run_started(&self, algorithm: Algorithm, left: &str, right: &str);
    fn run_finished(&self, stats: &DiffStats);
    fn run_failed(&self, error: &DiffError);
}

/// Does nothing. Used by tests and `--no-tracking`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn run_started(&self, _algorithm: Algorithm, _left: &str, _right: &str) {}
    fn run_finished(&self, _stats: &DiffStats) {}
    fn run_failed(&self, _error: &DiffError) {}
}

/// Reports lifecycle events at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracker;

impl Tracker for LogTracker {
    fn run_started(&self, algorithm: Algorithm, left: &str, right: &str) {
        tracing::info!(?algorithm, left, right, "diff started");
    }

    fn run_finished(&self, stats: &DiffStats) {
        tracing::info!(
            diffs = stats.total_diffs(),
            rows_left = stats.rows_left,
            rows_right = stats.rows_right,
            elapsed = stats.elapsed_seconds,
            status = ?stats.status,
            "diff finished"
        );
    }

    fn run_failed(&self, error: &DiffError) {
        tracing::error!(kind = %error.kind(), "diff failed: {error}");
    }
}
