//! Bisection planner.
//!
//! Splits an over-threshold segment into children of similar population:
//! rank-spaced checkpoints are selected from the left side, filtered to
//! keys that also exist on the right, and the survivors become the child
//! boundaries. When checkpoints are lost to the filter, adjacent ranges
//! simply merge — the child list is built from whatever survived.

use crate::plan::{QueryPlan, ScanSpec};
use crate::segment::{KeyBounds, Segment};
use crate::types::Key;

/// Query plan selecting `factor - 1` rank-spaced checkpoints from a side.
pub fn checkpoints_plan(scan: &ScanSpec, segment: &Segment, factor: usize) -> QueryPlan {
    QueryPlan::Checkpoints {
        scan: scan.with_bounds(segment.bounds.clone()),
        count: factor.saturating_sub(1).max(1),
    }
}

/// Query plan filtering candidate checkpoints to those existing on the
/// other side.
pub fn probe_plan(scan: &ScanSpec, segment: &Segment, candidates: Vec<Key>) -> QueryPlan {
    QueryPlan::KeyProbe {
        scan: scan.with_bounds(segment.bounds.clone()),
        keys: candidates,
    }
}

/// Whether the segment may be split at all.
pub fn splittable(segment: &Segment) -> bool {
    !segment.bounds.at_most_one_row()
}

/// Build aligned child segments from surviving checkpoints.
///
/// Checkpoints are deduplicated, ordered, and restricted to the strict
/// interior of the parent bounds; the parent's outer min/max are preserved
/// at the extremes. Returns `None` when fewer than two children remain —
/// the caller then retries with a doubled factor or falls through to a
/// local diff.
pub fn align_children(
    segment: &Segment,
    surviving: Vec<Key>,
    larger_side_rows: u64,
) -> Option<Vec<Segment>> {
    let mut checkpoints: Vec<Key> = surviving
        .into_iter()
        .filter(|k| interior(&segment.bounds, k))
        .collect();
    checkpoints.sort();
    checkpoints.dedup();

    if checkpoints.is_empty() {
        return None;
    }

    let child_count = checkpoints.len() + 1;
    let approx = Some(larger_side_rows / child_count as u64);

    let mut children = Vec::with_capacity(child_count);
    let mut lower = segment.bounds.min.clone();
    for checkpoint in checkpoints {
        children.push(segment.child(
            KeyBounds::new(lower.clone(), Some(checkpoint.clone())),
            approx,
        ));
        lower = Some(checkpoint);
    }
    children.push(segment.child(KeyBounds::new(lower, segment.bounds.max.clone()), approx));
    Some(children)
}

/// Strictly inside `(min, max)`: a checkpoint equal to either bound would
/// produce an empty child.
fn interior(bounds: &KeyBounds, key: &Key) -> bool {
    if let Some(min) = &bounds.min
        && key <= min
    {
        return false;
    }
    if let Some(max) = &bounds.max
        && key >= max
    {
        return false;
    }
    true
}
