//! In-process adapter.
//!
//! Interprets query plans directly over typed values, applying the same
//! canonical-text rules the SQL dialects emit as fragments. This is what
//! lets the whole engine — both algorithms, the pools, the stream — run
//! hermetically in tests, the way the teacher code paths that run outside
//! the server do.
//!
//! Stores are process-global and addressed by namespace, so two handles on
//! `memory://x` behave like two connections to one database while handles
//! on different namespaces behave like distinct engines.

use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, NaiveTime, Utc};

use crate::dialect::{Dialect, PostgresDialect};
use crate::error::DiffError;
use crate::plan::{FetchedRow, JoinedRow, QueryOutput, QueryPlan, ScanSpec};
use crate::segment::ChecksumResult;
use crate::table::{TablePath, TableSchema};
use crate::types::{ColumnType, Key, Value, hash_input};

/// One stored table: declared columns plus typed rows.
#[derive(Debug, Clone, Default)]
pub struct MemTable {
    pub columns: Vec<(String, ColumnType)>,
    pub rows: Vec<Vec<Value>>,
}

type Tables = BTreeMap<String, MemTable>;

fn registry() -> &'static Mutex<HashMap<String, Arc<Mutex<Tables>>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Mutex<Tables>>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Create or replace a table in a namespace. Test setup entry point.
pub fn create_table(
    namespace: &str,
    path: &TablePath,
    columns: Vec<(String, ColumnType)>,
    rows: Vec<Vec<Value>>,
) {
    let store = open_store(namespace);
    let mut tables = store.lock().expect("memory store poisoned");
    tables.insert(path.to_string(), MemTable { columns, rows });
}

/// Drop every table in a namespace. Lets tests reuse namespace names.
pub fn reset_namespace(namespace: &str) {
    let store = open_store(namespace);
    store.lock().expect("memory store poisoned").clear();
}

/// Read a table back (used by materialization tests).
pub fn read_table(namespace: &str, path: &TablePath) -> Option<MemTable> {
    let store = open_store(namespace);
    let tables = store.lock().expect("memory store poisoned");
    tables.get(&path.to_string()).cloned()
}

fn open_store(namespace: &str) -> Arc<Mutex<Tables>> {
    let mut reg = registry().lock().expect("memory registry poisoned");
    reg.entry(namespace.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(Tables::new())))
        .clone()
}

/// Dialect handed out by the memory adapter: PostgreSQL fragments under a
/// distinct name, so rendered plans stay printable in interactive mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryDialect;

impl Dialect for MemoryDialect {
    fn name(&self) -> &'static str {
        "memory"
    }
    fn quote(&self, ident: &str) -> String {
        PostgresDialect.quote(ident)
    }
    fn string_literal(&self, text: &str) -> String {
        PostgresDialect.string_literal(text)
    }
    fn supports_full_outer_join(&self) -> bool {
        true
    }
    fn normalize_expr(&self, column: &str, ty: &ColumnType) -> Result<String, DiffError> {
        PostgresDialect.normalize_expr(column, ty)
    }
    fn order_expr(&self, column: &str, ty: &ColumnType) -> String {
        PostgresDialect.order_expr(column, ty)
    }
    fn row_hash_expr(&self, concat_expr: &str) -> String {
        PostgresDialect.row_hash_expr(concat_expr)
    }
    fn checksum_fold_expr(&self, hash_expr: &str) -> String {
        PostgresDialect.checksum_fold_expr(hash_expr)
    }
    fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String {
        PostgresDialect.timestamp_literal(ts)
    }
    fn random_expr(&self) -> String {
        PostgresDialect.random_expr()
    }
    fn hash_separator_literal(&self) -> String {
        PostgresDialect.hash_separator_literal()
    }
    fn null_sentinel_literal(&self) -> String {
        PostgresDialect.null_sentinel_literal()
    }
}

pub struct MemoryAdapter {
    namespace: String,
    tables: Arc<Mutex<Tables>>,
    dialect: MemoryDialect,
}

impl MemoryAdapter {
    pub fn open(namespace: &str) -> Self {
        MemoryAdapter {
            namespace: namespace.to_string(),
            tables: open_store(namespace),
            dialect: MemoryDialect,
        }
    }

    /// Evaluate a scan: rows inside the key bounds and update-column time
    /// bounds, as `(key, canonical compared cells)`, sorted by key.
    fn scan(&self, spec: &ScanSpec) -> Result<Vec<(Key, Vec<Option<String>>)>, DiffError> {
        if spec.where_sql.is_some() {
            return Err(DiffError::FatalBackend(
                "memory adapter cannot evaluate opaque SQL predicates".into(),
            ));
        }
        let tables = self
            .tables
            .lock()
            .map_err(|_| DiffError::FatalBackend("memory store poisoned".into()))?;
        let table = tables
            .get(&spec.path.to_string())
            .ok_or_else(|| DiffError::TableNotFound(spec.path.to_string()))?;

        let col_index = |name: &str| -> Result<usize, DiffError> {
            table
                .columns
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| DiffError::UnknownColumn {
                    table: spec.path.to_string(),
                    column: name.to_string(),
                })
        };

        let key_idx: Vec<usize> = spec
            .key_columns
            .iter()
            .map(|(n, _)| col_index(n))
            .collect::<Result<_, _>>()?;
        let cmp_idx: Vec<usize> = spec
            .compared_columns
            .iter()
            .map(|(n, _)| col_index(n))
            .collect::<Result<_, _>>()?;
        let update_idx = match &spec.update_column {
            Some(name) => Some(col_index(name)?),
            None => None,
        };

        let mut out = Vec::new();
        for row in &table.rows {
            let mut key = Vec::with_capacity(key_idx.len());
            for &i in &key_idx {
                let kv = row[i].to_key_value().ok_or_else(|| {
                    DiffError::FatalBackend(format!(
                        "non-key value in key column of {}",
                        spec.path
                    ))
                })?;
                key.push(kv);
            }
            if !spec.bounds.contains(&key) {
                continue;
            }
            if let Some(i) = update_idx
                && !update_in_bounds(&row[i], &spec.min_update, &spec.max_update)
            {
                continue;
            }
            let cells: Vec<Option<String>> = cmp_idx
                .iter()
                .zip(spec.compared_columns.iter())
                .map(|(&i, (_, ty))| row[i].canonical(ty))
                .collect();
            out.push((key, cells));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Canonical text of a key tuple, matching what the SQL fragments
    /// project for key columns.
    fn canonical_keys(&self, key: &Key) -> Vec<Option<String>> {
        key.iter().map(|kv| Some(kv.to_string())).collect()
    }
}

fn update_in_bounds(
    value: &Value,
    min: &Option<DateTime<Utc>>,
    max: &Option<DateTime<Utc>>,
) -> bool {
    let instant = match value {
        Value::Timestamp(ts) => *ts,
        Value::Date(d) => DateTime::<Utc>::from_naive_utc_and_offset(
            d.and_time(NaiveTime::MIN),
            Utc,
        ),
        // NULL (or a non-temporal value) never satisfies a time bound,
        // matching SQL comparison semantics.
        _ => return min.is_none() && max.is_none(),
    };
    if let Some(min) = min
        && instant < *min
    {
        return false;
    }
    if let Some(max) = max
        && instant >= *max
    {
        return false;
    }
    true
}

/// 64-bit row hash: big-endian first 8 bytes of the MD5 digest, exactly
/// the SQL `('x' || substr(md5(text), 1, 16))::bit(64)::bigint`.
pub fn row_hash(text: &str) -> u64 {
    let digest = Md5::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl super::Database for MemoryAdapter {
    fn name(&self) -> String {
        format!("memory://{}", self.namespace)
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn execute(&self, plan: &QueryPlan) -> Result<QueryOutput, DiffError> {
        match plan {
            QueryPlan::Checksum(spec) => {
                let rows = self.scan(spec)?;
                let mut result = ChecksumResult::EMPTY;
                for (key, cells) in &rows {
                    let mut all = self.canonical_keys(key);
                    all.extend(cells.iter().cloned());
                    result.fold_row(row_hash(&hash_input(&all)));
                }
                Ok(QueryOutput::Checksum(result))
            }
            QueryPlan::KeyRange(spec) => {
                let rows = self.scan(spec)?;
                Ok(QueryOutput::KeyRange {
                    min: rows.first().map(|(k, _)| k.clone()),
                    max: rows.last().map(|(k, _)| k.clone()),
                })
            }
            QueryPlan::Checkpoints { scan, count } => {
                let rows = self.scan(scan)?;
                let keys: Vec<&Key> = rows.iter().map(|(k, _)| k).collect();
                let tiles = count + 1;
                let mut checkpoints: Vec<Key> = Vec::new();
                for i in 1..=*count {
                    let idx = keys.len() * i / tiles;
                    if idx == 0 || idx >= keys.len() {
                        continue;
                    }
                    let candidate = keys[idx].clone();
                    if checkpoints.last() != Some(&candidate) {
                        checkpoints.push(candidate);
                    }
                }
                Ok(QueryOutput::Keys(checkpoints))
            }
            QueryPlan::KeyProbe { scan, keys } => {
                let rows = self.scan(scan)?;
                let present: HashSet<&Key> = rows.iter().map(|(k, _)| k).collect();
                let mut found: Vec<Key> = keys
                    .iter()
                    .filter(|k| present.contains(*k))
                    .cloned()
                    .collect();
                found.sort();
                found.dedup();
                Ok(QueryOutput::Keys(found))
            }
            QueryPlan::FetchRows(spec) => {
                let rows = self.scan(spec)?;
                Ok(QueryOutput::Rows(
                    rows.into_iter()
                        .map(|(key, cells)| FetchedRow { key, cells })
                        .collect(),
                ))
            }
            QueryPlan::KeyUniqueness(spec) => {
                let rows = self.scan(spec)?;
                let distinct: HashSet<&Key> = rows.iter().map(|(k, _)| k).collect();
                Ok(QueryOutput::Uniqueness {
                    total: rows.len() as u64,
                    distinct: distinct.len() as u64,
                })
            }
            QueryPlan::OuterJoinDiff {
                left,
                right,
                sample_exclusive,
            } => {
                let joined = self.join_sides(left, right)?;
                let mut differing: Vec<JoinedRow> = Vec::new();
                let mut left_only = 0u64;
                let mut right_only = 0u64;
                for row in joined {
                    match (&row.left, &row.right) {
                        (Some(l), Some(r)) => {
                            if l != r {
                                differing.push(row);
                            }
                        }
                        (Some(_), None) => {
                            left_only += 1;
                            if sample_exclusive.is_none_or(|cap| left_only <= cap) {
                                differing.push(row);
                            }
                        }
                        (None, Some(_)) => {
                            right_only += 1;
                            if sample_exclusive.is_none_or(|cap| right_only <= cap) {
                                differing.push(row);
                            }
                        }
                        (None, None) => {}
                    }
                }
                Ok(QueryOutput::JoinRows(differing))
            }
            QueryPlan::Materialize {
                left,
                right,
                target,
                write_limit,
                all_rows,
            } => {
                let joined = self.join_sides(left, right)?;
                let mut columns: Vec<(String, ColumnType)> = Vec::new();
                for (name, _) in &left.key_columns {
                    columns.push((name.clone(), ColumnType::Text { trim: false }));
                }
                for (name, _) in &left.compared_columns {
                    columns.push((format!("left_{name}"), ColumnType::Text { trim: false }));
                }
                for (name, _) in &left.compared_columns {
                    columns.push((format!("right_{name}"), ColumnType::Text { trim: false }));
                }
                columns.push(("is_different".to_string(), ColumnType::Boolean));

                let mut rows = Vec::new();
                for row in joined {
                    let is_diff = match (&row.left, &row.right) {
                        (Some(l), Some(r)) => l != r,
                        _ => true,
                    };
                    if !*all_rows && !is_diff {
                        continue;
                    }
                    if rows.len() as u64 >= *write_limit {
                        break;
                    }
                    let n_cols = left.compared_columns.len();
                    let mut cells: Vec<Value> = row
                        .key
                        .iter()
                        .map(|kv| Value::Text(kv.to_string()))
                        .collect();
                    let side_cells = |side: &Option<Vec<Option<String>>>| -> Vec<Value> {
                        match side {
                            Some(cells) => cells
                                .iter()
                                .map(|c| match c {
                                    Some(text) => Value::Text(text.clone()),
                                    None => Value::Null,
                                })
                                .collect(),
                            None => vec![Value::Null; n_cols],
                        }
                    };
                    cells.extend(side_cells(&row.left));
                    cells.extend(side_cells(&row.right));
                    cells.push(Value::Bool(is_diff));
                    rows.push(cells);
                }
                let written = rows.len() as u64;
                let mut tables = self
                    .tables
                    .lock()
                    .map_err(|_| DiffError::FatalBackend("memory store poisoned".into()))?;
                tables.insert(target.to_string(), MemTable { columns, rows });
                Ok(QueryOutput::Written(written))
            }
        }
    }

    fn table_schema(&self, path: &TablePath) -> Result<TableSchema, DiffError> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| DiffError::FatalBackend("memory store poisoned".into()))?;
        let table = tables
            .get(&path.to_string())
            .ok_or_else(|| DiffError::TableNotFound(path.to_string()))?;
        Ok(TableSchema {
            columns: table.columns.clone(),
        })
    }

    fn connection_identity(&self) -> String {
        format!("memory://{}", self.namespace)
    }
}

impl MemoryAdapter {
    /// Full outer join of the two scans on the key, sorted by key.
    fn join_sides(&self, left: &ScanSpec, right: &ScanSpec) -> Result<Vec<JoinedRow>, DiffError> {
        let lrows = self.scan(left)?;
        let rrows = self.scan(right)?;
        let mut by_key: BTreeMap<Key, JoinedRow> = BTreeMap::new();
        for (key, cells) in lrows {
            by_key.insert(
                key.clone(),
                JoinedRow {
                    key,
                    left: Some(cells),
                    right: None,
                },
            );
        }
        for (key, cells) in rrows {
            by_key
                .entry(key.clone())
                .or_insert_with(|| JoinedRow {
                    key,
                    left: None,
                    right: None,
                })
                .right = Some(cells);
        }
        Ok(by_key.into_values().collect())
    }
}
