//! Local row differ.
//!
//! When a segment falls below the bisection threshold, both sides are
//! fetched in key order and walked in a single merge pass. Events come out
//! strictly key-ascending; a key present on both sides with differing
//! canonical cells yields a `-`/`+` pair.

use std::cmp::Ordering;

use crate::plan::FetchedRow;
use crate::stream::{DiffEvent, Sign};

/// Outcome counters of one merge walk, folded into the run stats.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeCounts {
    pub updated: u64,
}

/// Merge-walk two key-ordered row sets, invoking `emit` for each
/// difference in key-ascending order. Stops early when `emit` fails
/// (cancellation, limit), propagating the failure.
pub fn merge_diff<E>(
    left: &[FetchedRow],
    right: &[FetchedRow],
    mut emit: impl FnMut(DiffEvent) -> Result<(), E>,
) -> Result<MergeCounts, E> {
    let mut counts = MergeCounts::default();
    let mut l = left.iter().peekable();
    let mut r = right.iter().peekable();

    loop {
        match (l.peek(), r.peek()) {
            (Some(lrow), Some(rrow)) => match lrow.key.cmp(&rrow.key) {
                Ordering::Less => {
                    emit(minus(lrow))?;
                    l.next();
                }
                Ordering::Greater => {
                    emit(plus(rrow))?;
                    r.next();
                }
                Ordering::Equal => {
                    if lrow.cells != rrow.cells {
                        counts.updated += 1;
                        emit(minus(lrow))?;
                        emit(plus(rrow))?;
                    }
                    l.next();
                    r.next();
                }
            },
            (Some(lrow), None) => {
                emit(minus(lrow))?;
                l.next();
            }
            (None, Some(rrow)) => {
                emit(plus(rrow))?;
                r.next();
            }
            (None, None) => return Ok(counts),
        }
    }
}

fn minus(row: &FetchedRow) -> DiffEvent {
    DiffEvent {
        sign: Sign::Minus,
        key: row.key.clone(),
        row: row.cells.clone(),
    }
}

fn plus(row: &FetchedRow) -> DiffEvent {
    DiffEvent {
        sign: Sign::Plus,
        key: row.key.clone(),
        row: row.cells.clone(),
    }
}

/// Estimated wire size of a fetched rowset, for the stats summary.
pub fn rowset_bytes(rows: &[FetchedRow]) -> u64 {
    rows.iter()
        .map(|row| {
            row.cells
                .iter()
                .map(|c| c.as_deref().map_or(1, str::len) as u64)
                .sum::<u64>()
                + row.key.len() as u64 * 8
        })
        .sum()
}
