//! Table references and schema binding.
//!
//! A [`TableSegment`] is the caller-facing description of one side of a
//! comparison: path, key columns, optional update column, extra compared
//! columns (with SQL `LIKE`-style `%` patterns), an opaque filter, and
//! optional key/update bounds.
//!
//! Before any checksum is issued, [`bind_pair`] resolves both sides against
//! their live schemas, expands patterns, deduplicates, checks every
//! declared column exists, and unifies the two sides' declared types into
//! the common representation the normalizer renders. Mismatches fail here,
//! not mid-run.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::DiffError;
use crate::segment::KeyBounds;
use crate::types::ColumnType;

/// Qualified name of a table: one or more components (`schema.table` or
/// `database.schema.table`, dialect depending).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TablePath(pub Vec<String>);

impl TablePath {
    pub fn new<S: Into<String>>(parts: Vec<S>) -> Self {
        TablePath(parts.into_iter().map(Into::into).collect())
    }

    /// Parse a dotted path. Quoting is not interpreted; components are
    /// taken verbatim.
    pub fn parse(text: &str) -> Result<Self, DiffError> {
        let parts: Vec<String> = text.split('.').map(str::to_string).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(DiffError::InvalidArgument(format!(
                "empty component in table path {text:?}"
            )));
        }
        Ok(TablePath(parts))
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// One side of a comparison, as described by the caller.
#[derive(Debug, Clone)]
pub struct TableSegment {
    pub path: TablePath,
    /// Ordered, non-empty; together unique per row.
    pub key_columns: Vec<String>,
    /// Optional column whose change alone marks a row as changed.
    pub update_column: Option<String>,
    /// Additional compared columns; entries may contain `%` patterns.
    pub extra_columns: Vec<String>,
    /// Opaque extra predicate, scoped to this side only.
    pub where_sql: Option<String>,
    /// Time bounds applied to `update_column`.
    pub min_update: Option<DateTime<Utc>>,
    pub max_update: Option<DateTime<Utc>>,
    /// Initial key bounds; unbounded sides are widened by the orchestrator.
    pub key_bounds: KeyBounds,
    /// Whether column-name resolution is exact-case.
    pub case_sensitive: bool,
}

impl TableSegment {
    pub fn new(path: TablePath) -> Self {
        TableSegment {
            path,
            key_columns: vec!["id".to_string()],
            update_column: None,
            extra_columns: Vec::new(),
            where_sql: None,
            min_update: None,
            max_update: None,
            key_bounds: KeyBounds::unbounded(),
            case_sensitive: false,
        }
    }

    pub fn with_key_columns<S: Into<String>>(mut self, cols: Vec<S>) -> Self {
        self.key_columns = cols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_update_column<S: Into<String>>(mut self, col: S) -> Self {
        self.update_column = Some(col.into());
        self
    }

    pub fn with_extra_columns<S: Into<String>>(mut self, cols: Vec<S>) -> Self {
        self.extra_columns = cols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_where(mut self, predicate: &str) -> Self {
        self.where_sql = Some(predicate.to_string());
        self
    }

    pub fn with_update_bounds(
        mut self,
        min: Option<DateTime<Utc>>,
        max: Option<DateTime<Utc>>,
    ) -> Self {
        self.min_update = min;
        self.max_update = max;
        self
    }

    pub fn with_key_bounds(mut self, bounds: KeyBounds) -> Self {
        self.key_bounds = bounds;
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }
}

// ── Resolved schemas ───────────────────────────────────────────────────────

/// One side's resolved column list: actual stored names plus declared types.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub columns: Vec<(String, ColumnType)>,
}

impl TableSchema {
    fn lookup(&self, requested: &str, case_sensitive: bool) -> Option<&(String, ColumnType)> {
        self.columns.iter().find(|(name, _)| {
            if case_sensitive {
                name == requested
            } else {
                name.eq_ignore_ascii_case(requested)
            }
        })
    }
}

/// A compared non-key column after binding: per-side stored names plus the
/// unified type both normalizers render against.
#[derive(Debug, Clone)]
pub struct ComparedColumn {
    pub left_name: String,
    pub right_name: String,
    pub ty: ColumnType,
    /// Set on the update column; it is hashed exactly once even when also
    /// listed in `extra_columns`.
    pub is_update: bool,
}

/// The fully bound comparison: key columns and compared columns with
/// unified types, identical in order on both sides.
#[derive(Debug, Clone)]
pub struct BoundPair {
    pub left_key_columns: Vec<String>,
    pub right_key_columns: Vec<String>,
    pub key_types: Vec<ColumnType>,
    pub compared: Vec<ComparedColumn>,
}

impl BoundPair {
    /// Column names of one side, keys first then compared, in hash order.
    pub fn side_columns(&self, left: bool) -> Vec<(String, ColumnType)> {
        let mut cols: Vec<(String, ColumnType)> = if left {
            self.left_key_columns
                .iter()
                .cloned()
                .zip(self.key_types.iter().cloned())
                .collect()
        } else {
            self.right_key_columns
                .iter()
                .cloned()
                .zip(self.key_types.iter().cloned())
                .collect()
        };
        for c in &self.compared {
            let name = if left { &c.left_name } else { &c.right_name };
            cols.push((name.clone(), c.ty.clone()));
        }
        cols
    }
}

/// Resolve one side's declared columns against its live schema.
///
/// Returns `(key columns, compared columns)` with stored-case names and
/// declared types. Compared columns are the update column (if any) followed
/// by the expanded extras, minus key/update duplicates.
fn resolve_side(
    segment: &TableSegment,
    schema: &TableSchema,
) -> Result<(Vec<(String, ColumnType)>, Vec<(String, ColumnType)>), DiffError> {
    let table = segment.path.to_string();
    if segment.key_columns.is_empty() {
        return Err(DiffError::InvalidArgument(format!(
            "no key columns declared for table {table}"
        )));
    }

    let mut keys = Vec::new();
    for requested in &segment.key_columns {
        let (name, ty) = schema
            .lookup(requested, segment.case_sensitive)
            .ok_or_else(|| DiffError::UnknownColumn {
                table: table.clone(),
                column: requested.clone(),
            })?;
        if !ty.is_key_type() {
            return Err(DiffError::UnsupportedComparedType {
                column: name.clone(),
                type_repr: format!("{ty} (not usable as a key)"),
            });
        }
        keys.push((name.clone(), ty.clone()));
    }

    let mut compared: Vec<(String, ColumnType)> = Vec::new();
    if let Some(requested) = &segment.update_column {
        let (name, ty) = schema
            .lookup(requested, segment.case_sensitive)
            .ok_or_else(|| DiffError::UnknownColumn {
                table: table.clone(),
                column: requested.clone(),
            })?;
        compared.push((name.clone(), ty.clone()));
    }

    let taken: Vec<String> = keys
        .iter()
        .chain(compared.iter())
        .map(|(n, _)| n.clone())
        .collect();

    for requested in &segment.extra_columns {
        if is_pattern(requested) {
            let any_match = schema
                .columns
                .iter()
                .any(|(n, _)| like_match(requested, n, segment.case_sensitive));
            if !any_match {
                return Err(DiffError::UnknownColumn {
                    table: table.clone(),
                    column: requested.clone(),
                });
            }
            // Expanded matches that are already key or update columns are
            // excluded from the extras.
            for (name, ty) in &schema.columns {
                if like_match(requested, name, segment.case_sensitive)
                    && !taken.iter().any(|t| t == name)
                    && !compared.iter().any(|(n, _)| n == name)
                {
                    compared.push((name.clone(), ty.clone()));
                }
            }
        } else {
            let (name, ty) = schema
                .lookup(requested, segment.case_sensitive)
                .ok_or_else(|| DiffError::UnknownColumn {
                    table: table.clone(),
                    column: requested.clone(),
                })?;
            if taken.iter().any(|t| t == name) || compared.iter().any(|(n, _)| n == name) {
                continue;
            }
            compared.push((name.clone(), ty.clone()));
        }
    }

    for (name, ty) in keys.iter().chain(compared.iter()) {
        if let ColumnType::Unsupported { repr } = ty {
            return Err(DiffError::UnsupportedComparedType {
                column: name.clone(),
                type_repr: repr.clone(),
            });
        }
    }

    Ok((keys, compared))
}

/// Bind both sides and unify their types.
pub fn bind_pair(
    left: &TableSegment,
    left_schema: &TableSchema,
    right: &TableSegment,
    right_schema: &TableSchema,
) -> Result<BoundPair, DiffError> {
    let (left_keys, left_compared) = resolve_side(left, left_schema)?;
    let (right_keys, right_compared) = resolve_side(right, right_schema)?;

    if left_keys.len() != right_keys.len() {
        return Err(DiffError::InvalidArgument(format!(
            "key column count differs: {} vs {}",
            left_keys.len(),
            right_keys.len()
        )));
    }
    if left_compared.len() != right_compared.len() {
        return Err(DiffError::InvalidArgument(format!(
            "compared column count differs after expansion: {} vs {}",
            left_compared.len(),
            right_compared.len()
        )));
    }

    let mut key_types = Vec::new();
    for ((ln, lt), (_rn, rt)) in left_keys.iter().zip(right_keys.iter()) {
        key_types.push(lt.unify(rt, ln)?);
    }

    let left_has_update = left.update_column.is_some();
    let mut compared = Vec::new();
    for (i, ((ln, lt), (rn, rt))) in left_compared.iter().zip(right_compared.iter()).enumerate() {
        compared.push(ComparedColumn {
            left_name: ln.clone(),
            right_name: rn.clone(),
            ty: lt.unify(rt, ln)?,
            is_update: left_has_update && i == 0,
        });
    }

    Ok(BoundPair {
        left_key_columns: left_keys.into_iter().map(|(n, _)| n).collect(),
        right_key_columns: right_keys.into_iter().map(|(n, _)| n).collect(),
        key_types,
        compared,
    })
}

// ── LIKE-style pattern matching ────────────────────────────────────────────

fn is_pattern(text: &str) -> bool {
    text.contains('%')
}

/// SQL `LIKE` match with `%` (any run) only; `_` is treated literally
/// because column names routinely contain underscores.
pub fn like_match(pattern: &str, name: &str, case_sensitive: bool) -> bool {
    let (pattern, name) = if case_sensitive {
        (pattern.to_string(), name.to_string())
    } else {
        (pattern.to_ascii_lowercase(), name.to_ascii_lowercase())
    };
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut rest = name.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '%' (last part empty) — anything left matches.
    true
}
