//! Checksum executor.
//!
//! One aggregate query per side and segment:
//! `SELECT count(*), fold(hash(normalized columns)) FROM … WHERE bounds`.
//! Transient failures are retried on the pool worker per the fixed
//! 100 ms / 500 ms schedule; a failure past that surfaces as fatal and
//! cancels the owning subtree.

use crate::error::{DiffError, RetryPolicy};
use crate::plan::{QueryPlan, ScanSpec};
use crate::runtime::{DbPool, PendingQuery};
use crate::segment::{ChecksumResult, Segment};

/// The checksum plan for one side of a segment.
pub fn checksum_plan(scan: &ScanSpec, segment: &Segment) -> QueryPlan {
    QueryPlan::Checksum(scan.with_bounds(segment.bounds.clone()))
}

/// Submit the segment's checksum on one side. Left is always submitted
/// before right by the caller; the fixed order keeps the two connection
/// budgets deadlock-free.
pub fn submit_checksum(pool: &DbPool, scan: &ScanSpec, segment: &Segment) -> PendingQuery {
    pool.submit(checksum_plan(scan, segment), RetryPolicy::default())
}

/// Resolve a pending checksum reply.
pub fn wait_checksum(pending: PendingQuery) -> Result<ChecksumResult, DiffError> {
    pending.wait()?.into_checksum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::KeyBounds;
    use crate::table::TablePath;
    use crate::types::{ColumnType, KeyValue};

    #[test]
    fn test_checksum_plan_narrows_to_segment_bounds() {
        let scan = ScanSpec {
            path: TablePath::new(vec!["t"]),
            key_columns: vec![("id".to_string(), ColumnType::Integer)],
            compared_columns: vec![],
            bounds: KeyBounds::unbounded(),
            update_column: None,
            min_update: None,
            max_update: None,
            where_sql: None,
        };
        let bounds = KeyBounds::new(Some(vec![KeyValue::Int(5)]), Some(vec![KeyValue::Int(9)]));
        let segment = Segment::initial(bounds.clone());
        match checksum_plan(&scan, &segment) {
            QueryPlan::Checksum(spec) => assert_eq!(spec.bounds, bounds),
            other => panic!("unexpected plan {other:?}"),
        }
    }
}
