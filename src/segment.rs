//! Segment descriptors.
//!
//! A [`Segment`] is an immutable, contiguous key-range slice of the table
//! pair under comparison. Child segments produced by the bisection planner
//! carry narrower bounds; no segment is mutated once created.

use std::fmt;

use crate::types::{Key, KeyValue, format_key};

/// Inclusive-min, exclusive-max key bounds. `None` on either side means
/// unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBounds {
    pub min: Option<Key>,
    pub max: Option<Key>,
}

impl KeyBounds {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(min: Option<Key>, max: Option<Key>) -> Self {
        Self { min, max }
    }

    /// Whether a key falls inside `[min, max)`.
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(min) = &self.min
            && key < min
        {
            return false;
        }
        if let Some(max) = &self.max
            && key >= max
        {
            return false;
        }
        true
    }

    /// Whether both bounds are known and the range can hold at most one
    /// row. Such a range must not be split further.
    ///
    /// For a single integral key this is `max - min <= 1`; for any other
    /// key shape it is bound equality.
    pub fn at_most_one_row(&self) -> bool {
        match (&self.min, &self.max) {
            (Some(min), Some(max)) => {
                if let (1, Some(KeyValue::Int(lo)), Some(KeyValue::Int(hi))) =
                    (min.len(), min.first(), max.first())
                {
                    hi - lo <= 1
                } else {
                    min >= max
                }
            }
            _ => false,
        }
    }
}

impl fmt::Display for KeyBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.min {
            Some(min) => write!(f, "[{}", format_key(min))?,
            None => write!(f, "[-inf")?,
        }
        match &self.max {
            Some(max) => write!(f, ", {})", format_key(max)),
            None => write!(f, ", +inf)"),
        }
    }
}

/// An immutable key-range slice under active comparison.
#[derive(Debug, Clone)]
pub struct Segment {
    pub bounds: KeyBounds,
    /// Recursion depth; the initial segment is depth 0.
    pub depth: usize,
    /// Row count observed by the most recent checksum of the parent, when
    /// known. Used only for logging.
    pub approx_rows: Option<u64>,
}

impl Segment {
    pub fn initial(bounds: KeyBounds) -> Self {
        Segment {
            bounds,
            depth: 0,
            approx_rows: None,
        }
    }

    /// A child slice one level deeper with narrower bounds.
    pub fn child(&self, bounds: KeyBounds, approx_rows: Option<u64>) -> Self {
        Segment {
            bounds,
            depth: self.depth + 1,
            approx_rows,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment {} depth={}", self.bounds, self.depth)
    }
}

// ── Checksum results ───────────────────────────────────────────────────────

/// Result of one aggregate checksum query over a segment.
///
/// The checksum is an XOR fold of per-row 64-bit hashes. XOR is associative
/// and commutative, so the fold over a parent range equals the combination
/// of the folds over any partition of it into children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumResult {
    pub row_count: u64,
    pub checksum: u64,
}

impl ChecksumResult {
    pub const EMPTY: ChecksumResult = ChecksumResult {
        row_count: 0,
        checksum: 0,
    };

    /// Combine with a sibling's result.
    pub fn combine(&self, other: &ChecksumResult) -> ChecksumResult {
        ChecksumResult {
            row_count: self.row_count + other.row_count,
            checksum: self.checksum ^ other.checksum,
        }
    }

    /// Fold one row hash into the result.
    pub fn fold_row(&mut self, row_hash: u64) {
        self.row_count += 1;
        self.checksum ^= row_hash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyValue;

    fn ik(v: i64) -> Key {
        vec![KeyValue::Int(v)]
    }

    // ── bounds ──────────────────────────────────────────────────────

    #[test]
    fn test_bounds_contains_inclusive_min_exclusive_max() {
        let b = KeyBounds::new(Some(ik(10)), Some(ik(20)));
        assert!(b.contains(&ik(10)));
        assert!(b.contains(&ik(19)));
        assert!(!b.contains(&ik(20)));
        assert!(!b.contains(&ik(9)));
    }

    #[test]
    fn test_bounds_unbounded_contains_everything() {
        let b = KeyBounds::unbounded();
        assert!(b.contains(&ik(i64::MIN)));
        assert!(b.contains(&ik(i64::MAX)));
    }

    #[test]
    fn test_bounds_half_open_sides() {
        let b = KeyBounds::new(None, Some(ik(5)));
        assert!(b.contains(&ik(-100)));
        assert!(!b.contains(&ik(5)));

        let b = KeyBounds::new(Some(ik(5)), None);
        assert!(b.contains(&ik(5)));
        assert!(b.contains(&ik(1_000_000)));
    }

    #[test]
    fn test_at_most_one_row_integer_span() {
        assert!(KeyBounds::new(Some(ik(7)), Some(ik(8))).at_most_one_row());
        assert!(KeyBounds::new(Some(ik(7)), Some(ik(7))).at_most_one_row());
        assert!(!KeyBounds::new(Some(ik(7)), Some(ik(9))).at_most_one_row());
        assert!(!KeyBounds::new(Some(ik(7)), None).at_most_one_row());
    }

    #[test]
    fn test_at_most_one_row_text_key() {
        let a = vec![KeyValue::Text("a".into())];
        let b = vec![KeyValue::Text("b".into())];
        assert!(KeyBounds::new(Some(a.clone()), Some(a.clone())).at_most_one_row());
        assert!(!KeyBounds::new(Some(a), Some(b)).at_most_one_row());
    }

    #[test]
    fn test_bounds_display() {
        let b = KeyBounds::new(Some(ik(1)), None);
        assert_eq!(format!("{b}"), "[1, +inf)");
    }

    // ── segments ────────────────────────────────────────────────────

    #[test]
    fn test_child_segment_increments_depth() {
        let root = Segment::initial(KeyBounds::unbounded());
        let child = root.child(KeyBounds::new(Some(ik(0)), Some(ik(10))), Some(10));
        assert_eq!(child.depth, 1);
        assert_eq!(child.approx_rows, Some(10));
    }

    // ── checksum fold ───────────────────────────────────────────────

    #[test]
    fn test_checksum_combine_is_associative() {
        let a = ChecksumResult {
            row_count: 3,
            checksum: 0xDEAD,
        };
        let b = ChecksumResult {
            row_count: 5,
            checksum: 0xBEEF,
        };
        let c = ChecksumResult {
            row_count: 2,
            checksum: 0xF00D,
        };
        assert_eq!(a.combine(&b).combine(&c), a.combine(&b.combine(&c)));
    }

    #[test]
    fn test_checksum_children_fold_equals_parent() {
        // Folding rows one by one equals folding a partition of them.
        let hashes = [1u64, 99, 0xABCD_EF01, u64::MAX, 7];
        let mut parent = ChecksumResult::EMPTY;
        for h in hashes {
            parent.fold_row(h);
        }
        let mut left = ChecksumResult::EMPTY;
        let mut right = ChecksumResult::EMPTY;
        for h in &hashes[..2] {
            left.fold_row(*h);
        }
        for h in &hashes[2..] {
            right.fold_row(*h);
        }
        assert_eq!(left.combine(&right), parent);
    }
}
