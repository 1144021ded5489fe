//! Typed query plans.
//!
//! The engine never hands adapters raw SQL. Each unit of database work is
//! one of these immutable plan values: SQL adapters render a plan to text
//! through their dialect and execute it; the in-memory adapter interprets
//! the plan directly. Nodes are plain data with no back-references.

use chrono::{DateTime, Utc};

use crate::error::DiffError;
use crate::segment::{ChecksumResult, KeyBounds};
use crate::table::TablePath;
use crate::types::{ColumnType, Key, KeyValue};

/// The table scan every plan is built around: which table, which columns,
/// and which slice of the key space.
#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub path: TablePath,
    /// Key columns in declared order, with unified types.
    pub key_columns: Vec<(String, ColumnType)>,
    /// Compared non-key columns (update column first when present), with
    /// unified types.
    pub compared_columns: Vec<(String, ColumnType)>,
    pub bounds: KeyBounds,
    /// Time bounds applied to the update column.
    pub update_column: Option<String>,
    pub min_update: Option<DateTime<Utc>>,
    pub max_update: Option<DateTime<Utc>>,
    /// Opaque caller predicate; SQL adapters splice it in, the in-memory
    /// adapter rejects plans that carry one.
    pub where_sql: Option<String>,
}

impl ScanSpec {
    /// The same scan narrowed to different key bounds.
    pub fn with_bounds(&self, bounds: KeyBounds) -> ScanSpec {
        ScanSpec {
            bounds,
            ..self.clone()
        }
    }

    pub fn key_types(&self) -> Vec<ColumnType> {
        self.key_columns.iter().map(|(_, t)| t.clone()).collect()
    }
}

/// One unit of database work.
#[derive(Debug, Clone)]
pub enum QueryPlan {
    /// `(COUNT(*), xor-fold of row hashes)` over the scan.
    Checksum(ScanSpec),
    /// Min and max key tuple of the scan, ignoring its key bounds' absent
    /// sides. Used to widen unknown initial bounds.
    KeyRange(ScanSpec),
    /// `count` rank-spaced key values strictly inside the scan's bounds,
    /// in ascending order.
    Checkpoints { scan: ScanSpec, count: usize },
    /// Which of `keys` exist in the scan. Returns the surviving keys in
    /// ascending order.
    KeyProbe { scan: ScanSpec, keys: Vec<Key> },
    /// All rows of the scan ordered by key, with compared columns rendered
    /// to canonical text.
    FetchRows(ScanSpec),
    /// `COUNT(*)` vs `COUNT(DISTINCT key)` over the scan.
    KeyUniqueness(ScanSpec),
    /// FULL OUTER JOIN of the two scans on their key columns, restricted
    /// to rows where a compared column differs or one side is absent,
    /// ordered by key. Both scans must live in the same database.
    OuterJoinDiff {
        left: ScanSpec,
        right: ScanSpec,
        /// When set, rows existing on only one side are sampled down to
        /// this many per sign instead of returned in full.
        sample_exclusive: Option<u64>,
    },
    /// `CREATE TABLE target AS` the join projection, capped at
    /// `write_limit` rows.
    Materialize {
        left: ScanSpec,
        right: ScanSpec,
        target: TablePath,
        write_limit: u64,
        /// Include matching rows too, not only differing ones.
        all_rows: bool,
    },
}

impl QueryPlan {
    /// Short label for logs and the interactive prompt.
    pub fn label(&self) -> &'static str {
        match self {
            QueryPlan::Checksum(_) => "checksum",
            QueryPlan::KeyRange(_) => "key-range",
            QueryPlan::Checkpoints { .. } => "checkpoints",
            QueryPlan::KeyProbe { .. } => "key-probe",
            QueryPlan::FetchRows(_) => "fetch-rows",
            QueryPlan::KeyUniqueness(_) => "key-uniqueness",
            QueryPlan::OuterJoinDiff { .. } => "joindiff",
            QueryPlan::Materialize { .. } => "materialize",
        }
    }
}

// ── Results ────────────────────────────────────────────────────────────────

/// A fetched row: decoded key plus canonical text of each compared column.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRow {
    pub key: Key,
    pub cells: Vec<Option<String>>,
}

/// One row of the outer-join diff. An absent side means the key exists
/// only on the other side.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub key: Key,
    pub left: Option<Vec<Option<String>>>,
    pub right: Option<Vec<Option<String>>>,
}

/// What a plan evaluates to.
#[derive(Debug, Clone)]
pub enum QueryOutput {
    Checksum(ChecksumResult),
    KeyRange {
        min: Option<Key>,
        max: Option<Key>,
    },
    Keys(Vec<Key>),
    Rows(Vec<FetchedRow>),
    Uniqueness {
        total: u64,
        distinct: u64,
    },
    JoinRows(Vec<JoinedRow>),
    Written(u64),
}

impl QueryOutput {
    pub fn into_checksum(self) -> Result<ChecksumResult, DiffError> {
        match self {
            QueryOutput::Checksum(c) => Ok(c),
            other => Err(shape_error("checksum", &other)),
        }
    }

    pub fn into_keys(self) -> Result<Vec<Key>, DiffError> {
        match self {
            QueryOutput::Keys(k) => Ok(k),
            other => Err(shape_error("keys", &other)),
        }
    }

    pub fn into_rows(self) -> Result<Vec<FetchedRow>, DiffError> {
        match self {
            QueryOutput::Rows(r) => Ok(r),
            other => Err(shape_error("rows", &other)),
        }
    }
}

fn shape_error(expected: &str, got: &QueryOutput) -> DiffError {
    DiffError::FatalBackend(format!(
        "adapter returned the wrong result shape: expected {expected}, got {got:?}"
    ))
}

/// Decode a key tuple from wire text using the unified key types.
pub fn decode_key(texts: &[Option<String>], types: &[ColumnType]) -> Result<Key, DiffError> {
    if texts.len() != types.len() {
        return Err(DiffError::FatalBackend(format!(
            "key arity mismatch: got {} components, expected {}",
            texts.len(),
            types.len()
        )));
    }
    let mut key = Vec::with_capacity(texts.len());
    for (text, ty) in texts.iter().zip(types) {
        let text = text
            .as_deref()
            .ok_or_else(|| DiffError::FatalBackend("NULL in key column".to_string()))?;
        let kv = match ty {
            ColumnType::Integer => KeyValue::Int(text.trim().parse().map_err(|_| {
                DiffError::FatalBackend(format!("non-integral key value {text:?}"))
            })?),
            ColumnType::Uuid => KeyValue::Text(text.to_lowercase()),
            _ => KeyValue::Text(text.to_string()),
        };
        key.push(kv);
    }
    Ok(key)
}
