//! HashDiff orchestrator.
//!
//! The recursive cross-engine algorithm. Each segment pair moves through
//! the state machine:
//!
//! ```text
//! UNCHECKED → (checksum both sides) → EQUAL                (terminal)
//!                                   → SMALL → local diff   (terminal)
//!                                   → SPLIT → m child pairs, each UNCHECKED
//! any state → CANCELLED                                    (terminal)
//! ```
//!
//! Segment tasks run on the orchestration pool; per-side queries run on
//! the side pools. A failing segment cancels only its own subtree and
//! records the error — the rest of the run continues unless
//! `strict_errors` is set.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::checksum::{submit_checksum, wait_checksum};
use crate::error::{DiffError, RetryPolicy};
use crate::plan::{FetchedRow, QueryPlan, ScanSpec};
use crate::planner;
use crate::rowdiff::{self, merge_diff};
use crate::runtime::{CancelReason, CancelToken, DbPool, TaskPool};
use crate::segment::{KeyBounds, Segment};
use crate::stream::{DiffEmitter, Sign};
use crate::types::{Key, KeyValue};

/// HashDiff tuning knobs.
#[derive(Debug, Clone)]
pub struct HashDiffConfig {
    /// Number of children an over-threshold segment splits into.
    pub bisection_factor: usize,
    /// Row count at or below which a segment is fetched and compared
    /// locally.
    pub bisection_threshold: u64,
    /// Fail the whole run on the first segment failure instead of
    /// sacrificing only the subtree.
    pub strict_errors: bool,
}

impl Default for HashDiffConfig {
    fn default() -> Self {
        HashDiffConfig {
            bisection_factor: 32,
            bisection_threshold: 16_384,
            strict_errors: false,
        }
    }
}

/// One side's execution context: its pool and its scan template.
pub struct Side {
    pub pool: DbPool,
    pub scan: ScanSpec,
}

pub struct HashDiffer {
    pub left: Side,
    pub right: Side,
    pub config: HashDiffConfig,
    pub emitter: DiffEmitter,
    pub cancel: CancelToken,
    failure: Mutex<Option<DiffError>>,
}

impl HashDiffer {
    pub fn new(
        left: Side,
        right: Side,
        config: HashDiffConfig,
        emitter: DiffEmitter,
        cancel: CancelToken,
    ) -> Self {
        HashDiffer {
            left,
            right,
            config,
            emitter,
            cancel,
            failure: Mutex::new(None),
        }
    }

    /// Shared stats counters, surviving the differ itself.
    pub fn stats_handle(&self) -> Arc<crate::stream::StatsCell> {
        self.emitter.stats.clone()
    }

    /// Run the whole tree to termination.
    ///
    /// `Err` means the run could not start at all; `Ok(Some(e))` means it
    /// terminated but sacrificed at least one subtree to `e` — partial
    /// results emitted so far are valid.
    pub fn run(self: &Arc<Self>, tasks: &Arc<TaskPool>) -> Result<Option<DiffError>, DiffError> {
        let bounds = self.initial_bounds()?;
        let root = Segment::initial(bounds);
        let this = self.clone();
        let tasks2 = tasks.clone();
        tasks.spawn(move || this.diff_segment(&tasks2, root));
        tasks.wait_idle();

        match self.failure.lock() {
            Ok(mut failure) => Ok(failure.take()),
            Err(_) => Err(DiffError::FatalBackend("failure slot poisoned".into())),
        }
    }

    /// Resolve unknown initial bounds by querying min/max keys on both
    /// sides; the wider union becomes the root segment's bounds.
    fn initial_bounds(&self) -> Result<KeyBounds, DiffError> {
        let declared = &self.left.scan.bounds;
        if declared.min.is_some() && declared.max.is_some() {
            return Ok(declared.clone());
        }
        let pending_left = self
            .left
            .pool
            .submit(QueryPlan::KeyRange(self.left.scan.clone()), RetryPolicy::default());
        let pending_right = self
            .right
            .pool
            .submit(QueryPlan::KeyRange(self.right.scan.clone()), RetryPolicy::default());
        let (lmin, lmax) = match pending_left.wait()? {
            crate::plan::QueryOutput::KeyRange { min, max } => (min, max),
            other => {
                return Err(DiffError::FatalBackend(format!(
                    "unexpected key-range result {other:?}"
                )));
            }
        };
        let (rmin, rmax) = match pending_right.wait()? {
            crate::plan::QueryOutput::KeyRange { min, max } => (min, max),
            other => {
                return Err(DiffError::FatalBackend(format!(
                    "unexpected key-range result {other:?}"
                )));
            }
        };

        let min = declared
            .min
            .clone()
            .or(union_bound(lmin, rmin, false));
        let max = declared
            .max
            .clone()
            .or(union_bound(lmax, rmax, true).and_then(exclusive_upper));
        Ok(KeyBounds::new(min, max))
    }

    /// One segment pair through the state machine. Task body.
    fn diff_segment(self: &Arc<Self>, tasks: &Arc<TaskPool>, segment: Segment) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(segment = %segment, "checksumming");

        let pending_left = submit_checksum(&self.left.pool, &self.left.scan, &segment);
        let pending_right = submit_checksum(&self.right.pool, &self.right.scan, &segment);
        let left = match wait_checksum(pending_left) {
            Ok(c) => c,
            Err(e) => return self.fail_segment(&segment, e),
        };
        let right = match wait_checksum(pending_right) {
            Ok(c) => c,
            Err(e) => return self.fail_segment(&segment, e),
        };

        let stats = &self.emitter.stats;
        stats.segments_checksummed.fetch_add(1, Ordering::Relaxed);
        if segment.depth == 0 {
            stats.rows_left.store(left.row_count, Ordering::Relaxed);
            stats.rows_right.store(right.row_count, Ordering::Relaxed);
        }

        if left == right {
            // Also covers both sides empty under unequal declared bounds:
            // an empty intersection compares equal.
            if left.row_count == 0 {
                tracing::debug!(segment = %segment, "both sides empty, treated as equal");
            }
            return;
        }

        // One empty side: the other side's rows are the diff. Skip
        // further checksums and fetch just that side.
        if left.row_count == 0 || right.row_count == 0 {
            return self.emit_one_sided(&segment, left.row_count == 0);
        }

        let rows = left.row_count.max(right.row_count);
        if rows <= self.config.bisection_threshold || !planner::splittable(&segment) {
            return self.local_diff(&segment);
        }

        match self.split(&segment, rows) {
            Ok(Some(children)) => {
                stats.segments_split.fetch_add(1, Ordering::Relaxed);
                for child in children {
                    let this = self.clone();
                    let tasks2 = tasks.clone();
                    tasks.spawn(move || this.diff_segment(&tasks2, child));
                }
            }
            // Too few checkpoints even after the doubled retry: compare
            // the segment locally regardless of its size.
            Ok(None) => self.local_diff(&segment),
            Err(e) => self.fail_segment(&segment, e),
        }
    }

    /// Plan a split: rank checkpoints from the left, keep those that exist
    /// on the right. One or fewer survivors forces one retry with a
    /// doubled factor; one or fewer again means the segment cannot be
    /// bisected and the caller compares it locally.
    fn split(&self, segment: &Segment, rows: u64) -> Result<Option<Vec<Segment>>, DiffError> {
        for factor in [
            self.config.bisection_factor,
            self.config.bisection_factor * 2,
        ] {
            if self.cancel.is_cancelled() {
                return Err(self.cancel.as_error());
            }
            let candidates = self
                .left
                .pool
                .submit(
                    planner::checkpoints_plan(&self.left.scan, segment, factor),
                    RetryPolicy::default(),
                )
                .wait()?
                .into_keys()?;
            if candidates.is_empty() {
                continue;
            }
            let surviving = self
                .right
                .pool
                .submit(
                    planner::probe_plan(&self.right.scan, segment, candidates),
                    RetryPolicy::default(),
                )
                .wait()?
                .into_keys()?;
            if surviving.len() <= 1 {
                continue;
            }
            if let Some(children) = planner::align_children(segment, surviving, rows) {
                if children.len() >= 2 {
                    return Ok(Some(children));
                }
            }
        }
        Ok(None)
    }

    /// Fetch both sides (left first) and merge-walk them.
    fn local_diff(self: &Arc<Self>, segment: &Segment) {
        let left_rows = match self.fetch_side(segment, true) {
            Ok(rows) => rows,
            Err(e) => return self.fail_segment(segment, e),
        };
        let right_rows = match self.fetch_side(segment, false) {
            Ok(rows) => rows,
            Err(e) => return self.fail_segment(segment, e),
        };

        let counts = merge_diff(&left_rows, &right_rows, |event| self.emitter.emit(event));
        match counts {
            Ok(counts) => {
                self.emitter
                    .stats
                    .updated_rows
                    .fetch_add(counts.updated, Ordering::Relaxed);
            }
            // Emission failures are cancellation signals, not errors.
            Err(e) if e.is_signal() => {}
            Err(e) => self.fail_segment(segment, e),
        }
    }

    /// Fast path for a segment empty on one side.
    fn emit_one_sided(self: &Arc<Self>, segment: &Segment, left_empty: bool) {
        let sign = if left_empty { Sign::Plus } else { Sign::Minus };
        let rows = match self.fetch_side(segment, !left_empty) {
            Ok(rows) => rows,
            Err(e) => return self.fail_segment(segment, e),
        };
        for row in rows {
            let event = crate::stream::DiffEvent {
                sign,
                key: row.key,
                row: row.cells,
            };
            match self.emitter.emit(event) {
                Ok(()) => {}
                Err(e) if e.is_signal() => return,
                Err(e) => return self.fail_segment(segment, e),
            }
        }
    }

    fn fetch_side(&self, segment: &Segment, left: bool) -> Result<Vec<FetchedRow>, DiffError> {
        let side = if left { &self.left } else { &self.right };
        let rows = side
            .pool
            .submit(
                QueryPlan::FetchRows(side.scan.with_bounds(segment.bounds.clone())),
                RetryPolicy::default(),
            )
            .wait()?
            .into_rows()?;
        let stats = &self.emitter.stats;
        stats
            .rows_downloaded
            .fetch_add(rows.len() as u64, Ordering::Relaxed);
        stats
            .bytes_downloaded
            .fetch_add(rowdiff::rowset_bytes(&rows), Ordering::Relaxed);
        Ok(rows)
    }

    /// Record a subtree failure. Internal signals are dropped silently;
    /// real failures surface in the run result, and under `strict_errors`
    /// they cancel everything still pending.
    fn fail_segment(&self, segment: &Segment, error: DiffError) {
        if error.is_signal() {
            return;
        }
        tracing::warn!(segment = %segment, "segment failed: {error}");
        if let Ok(mut slot) = self.failure.lock()
            && slot.is_none()
        {
            *slot = Some(error);
        }
        if self.config.strict_errors {
            self.cancel.cancel(CancelReason::Failed);
            self.left.pool.cancel_inflight();
            self.right.pool.cancel_inflight();
        }
    }
}

/// Union of two per-side bounds: the wider one wins.
fn union_bound(a: Option<Key>, b: Option<Key>, upper: bool) -> Option<Key> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if upper {
            a.max(b)
        } else {
            a.min(b)
        }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Turn an inclusive max key into an exclusive upper bound. Integral keys
/// step up by one; other key shapes stay unbounded above (no rows exist
/// past the observed maximum anyway).
fn exclusive_upper(key: Key) -> Option<Key> {
    if let [KeyValue::Int(v)] = key.as_slice() {
        return Some(vec![KeyValue::Int(v.saturating_add(1))]);
    }
    None
}
