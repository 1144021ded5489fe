//! Plan-to-SQL rendering.
//!
//! Composes the dialect's fragments into complete statements. All aliases
//! are prefixed `__td_` so they cannot collide with user columns. The
//! joindiff query is assembled as a `WITH` chain: both sides are first
//! normalized to canonical text, then full-outer-joined on the canonical
//! key with a per-row difference flag.

use crate::dialect::Dialect;
use crate::error::DiffError;
use crate::plan::{QueryPlan, ScanSpec};
use crate::table::TablePath;
use crate::types::Key;

/// Render a plan to one or more SQL statements, in execution order.
pub fn render_plan(d: &dyn Dialect, plan: &QueryPlan) -> Result<Vec<String>, DiffError> {
    match plan {
        QueryPlan::Checksum(scan) => Ok(vec![checksum_sql(d, scan)?]),
        QueryPlan::KeyRange(scan) => Ok(vec![
            key_range_sql(d, scan, false)?,
            key_range_sql(d, scan, true)?,
        ]),
        QueryPlan::Checkpoints { scan, count } => Ok(vec![checkpoints_sql(d, scan, *count)?]),
        QueryPlan::KeyProbe { scan, keys } => Ok(vec![key_probe_sql(d, scan, keys)?]),
        QueryPlan::FetchRows(scan) => Ok(vec![fetch_rows_sql(d, scan)?]),
        QueryPlan::KeyUniqueness(scan) => Ok(vec![key_uniqueness_sql(d, scan)?]),
        QueryPlan::OuterJoinDiff {
            left,
            right,
            sample_exclusive,
        } => Ok(vec![outer_join_sql(d, left, right, *sample_exclusive)?]),
        QueryPlan::Materialize {
            left,
            right,
            target,
            write_limit,
            all_rows,
        } => Ok(vec![materialize_sql(
            d,
            left,
            right,
            target,
            *write_limit,
            *all_rows,
        )?]),
    }
}

// ── Shared pieces ──────────────────────────────────────────────────────────

pub(crate) fn qualified_path(d: &dyn Dialect, path: &TablePath) -> String {
    path.0
        .iter()
        .map(|part| d.quote(part))
        .collect::<Vec<_>>()
        .join(".")
}

/// WHERE conditions of a scan: key bounds, update-column time bounds, and
/// the caller's opaque predicate.
fn scan_conditions(d: &dyn Dialect, scan: &ScanSpec) -> Vec<String> {
    let mut conds = Vec::new();

    let order_tuple = key_tuple(d, scan);
    if let Some(min) = &scan.bounds.min {
        conds.push(format!("{order_tuple} >= {}", key_literal_tuple(d, min)));
    }
    if let Some(max) = &scan.bounds.max {
        conds.push(format!("{order_tuple} < {}", key_literal_tuple(d, max)));
    }

    if let Some(update) = &scan.update_column {
        let col = d.quote(update);
        if let Some(min) = &scan.min_update {
            conds.push(format!("{col} >= {}", d.timestamp_literal(min)));
        }
        if let Some(max) = &scan.max_update {
            conds.push(format!("{col} < {}", d.timestamp_literal(max)));
        }
    }

    if let Some(predicate) = &scan.where_sql {
        conds.push(format!("({predicate})"));
    }
    conds
}

fn where_clause(conds: &[String]) -> String {
    if conds.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conds.join(" AND "))
    }
}

/// `(o1, o2)` — or bare `o1` for a single key column — in order form.
fn key_tuple(d: &dyn Dialect, scan: &ScanSpec) -> String {
    let exprs: Vec<String> = scan
        .key_columns
        .iter()
        .map(|(name, ty)| d.order_expr(name, ty))
        .collect();
    if exprs.len() == 1 {
        exprs.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", exprs.join(", "))
    }
}

fn key_literal_tuple(d: &dyn Dialect, key: &Key) -> String {
    let lits: Vec<String> = key.iter().map(|kv| d.key_literal(kv)).collect();
    if lits.len() == 1 {
        lits.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", lits.join(", "))
    }
}

fn key_order_list(d: &dyn Dialect, scan: &ScanSpec, descending: bool) -> String {
    let dir = if descending { " DESC" } else { "" };
    scan.key_columns
        .iter()
        .map(|(name, ty)| format!("{}{dir}", d.order_expr(name, ty)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Normalized select list for the key columns.
fn normalized_keys(d: &dyn Dialect, scan: &ScanSpec) -> Result<Vec<String>, DiffError> {
    scan.key_columns
        .iter()
        .map(|(name, ty)| d.normalize_expr(name, ty))
        .collect()
}

/// The row-hash input: every compared column (keys first) normalized,
/// NULL-coalesced, and joined with the separator.
fn hash_concat(d: &dyn Dialect, scan: &ScanSpec) -> Result<String, DiffError> {
    let sep = d.hash_separator_literal();
    let null = d.null_sentinel_literal();
    let mut parts = Vec::new();
    for (name, ty) in scan.key_columns.iter().chain(scan.compared_columns.iter()) {
        let norm = d.normalize_expr(name, ty)?;
        parts.push(format!("coalesce({norm}, {null})"));
    }
    Ok(parts.join(&format!(" || {sep} || ")))
}

// ── Statement renderers ────────────────────────────────────────────────────

fn checksum_sql(d: &dyn Dialect, scan: &ScanSpec) -> Result<String, DiffError> {
    let hash = d.row_hash_expr(&hash_concat(d, scan)?);
    let fold = d.checksum_fold_expr(&hash);
    Ok(format!(
        "SELECT count(*), {fold} FROM {}{}",
        qualified_path(d, &scan.path),
        where_clause(&scan_conditions(d, scan)),
    ))
}

fn key_range_sql(d: &dyn Dialect, scan: &ScanSpec, descending: bool) -> Result<String, DiffError> {
    Ok(format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT 1",
        normalized_keys(d, scan)?.join(", "),
        qualified_path(d, &scan.path),
        where_clause(&scan_conditions(d, scan)),
        key_order_list(d, scan, descending),
    ))
}

fn checkpoints_sql(d: &dyn Dialect, scan: &ScanSpec, count: usize) -> Result<String, DiffError> {
    let n_tiles = count + 1;
    let key_aliases: Vec<String> = (0..scan.key_columns.len())
        .map(|i| format!("__td_k{i}"))
        .collect();
    let order_aliases: Vec<String> = (0..scan.key_columns.len())
        .map(|i| format!("__td_o{i}"))
        .collect();

    let mut inner_select: Vec<String> = Vec::new();
    for (i, (name, ty)) in scan.key_columns.iter().enumerate() {
        inner_select.push(format!("{} AS __td_k{i}", d.normalize_expr(name, ty)?));
        inner_select.push(format!("{} AS __td_o{i}", d.order_expr(name, ty)));
    }

    let order_desc = order_aliases
        .iter()
        .map(|a| format!("{a} DESC"))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "SELECT {keys} FROM (\
         SELECT DISTINCT ON (__td_tile) __td_tile, {keys} FROM (\
         SELECT {inner}, ntile({n_tiles}) OVER (ORDER BY {order}) AS __td_tile \
         FROM {path}{filter}\
         ) __td_ranked ORDER BY __td_tile, {order_desc}\
         ) __td_tiles ORDER BY __td_tile LIMIT {count}",
        keys = key_aliases.join(", "),
        inner = inner_select.join(", "),
        order = key_order_list(d, scan, false),
        path = qualified_path(d, &scan.path),
        filter = where_clause(&scan_conditions(d, scan)),
    ))
}

fn key_probe_sql(d: &dyn Dialect, scan: &ScanSpec, keys: &[Key]) -> Result<String, DiffError> {
    let tuples: Vec<String> = keys.iter().map(|k| key_literal_tuple(d, k)).collect();
    let mut conds = scan_conditions(d, scan);
    conds.push(format!(
        "{} IN ({})",
        key_tuple(d, scan),
        tuples.join(", ")
    ));
    Ok(format!(
        "SELECT {} FROM {}{} ORDER BY {}",
        normalized_keys(d, scan)?.join(", "),
        qualified_path(d, &scan.path),
        where_clause(&conds),
        key_order_list(d, scan, false),
    ))
}

fn fetch_rows_sql(d: &dyn Dialect, scan: &ScanSpec) -> Result<String, DiffError> {
    let mut select = normalized_keys(d, scan)?;
    for (name, ty) in &scan.compared_columns {
        select.push(d.normalize_expr(name, ty)?);
    }
    Ok(format!(
        "SELECT {} FROM {}{} ORDER BY {}",
        select.join(", "),
        qualified_path(d, &scan.path),
        where_clause(&scan_conditions(d, scan)),
        key_order_list(d, scan, false),
    ))
}

fn key_uniqueness_sql(d: &dyn Dialect, scan: &ScanSpec) -> Result<String, DiffError> {
    Ok(format!(
        "SELECT count(*), count(DISTINCT {}) FROM {}{}",
        key_tuple(d, scan),
        qualified_path(d, &scan.path),
        where_clause(&scan_conditions(d, scan)),
    ))
}

/// The `WITH` chain shared by joindiff and materialization: normalized
/// sides, then a full outer join carrying key aliases, per-side presence
/// flags, per-side compared values, and a difference flag.
fn join_with_chain(
    d: &dyn Dialect,
    left: &ScanSpec,
    right: &ScanSpec,
) -> Result<(String, usize, usize), DiffError> {
    let n_keys = left.key_columns.len();
    let n_cols = left.compared_columns.len();

    let side_cte = |scan: &ScanSpec| -> Result<String, DiffError> {
        let mut select = Vec::new();
        for (i, (name, ty)) in scan.key_columns.iter().enumerate() {
            select.push(format!("{} AS __td_k{i}", d.normalize_expr(name, ty)?));
        }
        for (j, (name, ty)) in scan.compared_columns.iter().enumerate() {
            select.push(format!("{} AS __td_c{j}", d.normalize_expr(name, ty)?));
        }
        select.push("true AS __td_present".to_string());
        Ok(format!(
            "SELECT {} FROM {}{}",
            select.join(", "),
            qualified_path(d, &scan.path),
            where_clause(&scan_conditions(d, scan)),
        ))
    };

    let mut projection = Vec::new();
    for i in 0..n_keys {
        projection.push(format!(
            "coalesce(__td_l.__td_k{i}, __td_r.__td_k{i}) AS __td_k{i}"
        ));
    }
    projection.push("__td_l.__td_present AS __td_lp".to_string());
    projection.push("__td_r.__td_present AS __td_rp".to_string());
    for j in 0..n_cols {
        projection.push(format!("__td_l.__td_c{j} AS __td_lc{j}"));
    }
    for j in 0..n_cols {
        projection.push(format!("__td_r.__td_c{j} AS __td_rc{j}"));
    }

    let mut different = vec![
        "__td_l.__td_present IS NULL".to_string(),
        "__td_r.__td_present IS NULL".to_string(),
    ];
    for j in 0..n_cols {
        different.push(format!(
            "__td_l.__td_c{j} IS DISTINCT FROM __td_r.__td_c{j}"
        ));
    }
    projection.push(format!("({}) AS __td_is_diff", different.join(" OR ")));

    let join_on = (0..n_keys)
        .map(|i| format!("__td_l.__td_k{i} = __td_r.__td_k{i}"))
        .collect::<Vec<_>>()
        .join(" AND ");

    let chain = format!(
        "WITH __td_lhs AS ({lhs}), __td_rhs AS ({rhs}), __td_joined AS (\
         SELECT {projection} FROM __td_lhs __td_l \
         FULL OUTER JOIN __td_rhs __td_r ON {join_on})",
        lhs = side_cte(left)?,
        rhs = side_cte(right)?,
        projection = projection.join(", "),
    );
    Ok((chain, n_keys, n_cols))
}

fn key_alias_list(n_keys: usize) -> String {
    (0..n_keys)
        .map(|i| format!("__td_k{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn outer_join_sql(
    d: &dyn Dialect,
    left: &ScanSpec,
    right: &ScanSpec,
    sample_exclusive: Option<u64>,
) -> Result<String, DiffError> {
    let (chain, n_keys, _) = join_with_chain(d, left, right)?;
    let keys = key_alias_list(n_keys);
    let sql = match sample_exclusive {
        None => format!(
            "{chain} SELECT * FROM __td_joined WHERE __td_is_diff ORDER BY {keys}"
        ),
        Some(cap) => format!(
            "{chain} SELECT * FROM (\
             SELECT * FROM __td_joined WHERE __td_is_diff AND __td_lp AND __td_rp \
             UNION ALL (SELECT * FROM __td_joined WHERE __td_rp IS NULL \
             ORDER BY {random} LIMIT {cap}) \
             UNION ALL (SELECT * FROM __td_joined WHERE __td_lp IS NULL \
             ORDER BY {random} LIMIT {cap})\
             ) __td_sampled ORDER BY {keys}",
            random = d.random_expr(),
        ),
    };
    Ok(sql)
}

fn materialize_sql(
    d: &dyn Dialect,
    left: &ScanSpec,
    right: &ScanSpec,
    target: &TablePath,
    write_limit: u64,
    all_rows: bool,
) -> Result<String, DiffError> {
    let (chain, n_keys, _) = join_with_chain(d, left, right)?;
    let keys = key_alias_list(n_keys);
    let filter = if all_rows {
        String::new()
    } else {
        " WHERE __td_is_diff".to_string()
    };
    Ok(format!(
        "CREATE TABLE {} AS {chain} \
         SELECT * FROM __td_joined{filter} ORDER BY {keys} LIMIT {write_limit}",
        qualified_path(d, target),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;
    use crate::segment::KeyBounds;
    use crate::types::{ColumnType, KeyValue};

    fn scan() -> ScanSpec {
        ScanSpec {
            path: TablePath::new(vec!["public", "ratings"]),
            key_columns: vec![("id".to_string(), ColumnType::Integer)],
            compared_columns: vec![
                (
                    "updated_at".to_string(),
                    ColumnType::Timestamp {
                        precision: 0,
                        with_timezone: false,
                    },
                ),
                ("status".to_string(), ColumnType::Text { trim: false }),
            ],
            bounds: KeyBounds::unbounded(),
            update_column: None,
            min_update: None,
            max_update: None,
            where_sql: None,
        }
    }

    fn ik(v: i64) -> Key {
        vec![KeyValue::Int(v)]
    }

    #[test]
    fn test_checksum_sql_shape() {
        let sql = checksum_sql(&PostgresDialect, &scan()).unwrap();
        assert!(sql.starts_with("SELECT count(*), coalesce(bit_xor("), "{sql}");
        assert!(sql.contains("md5("), "{sql}");
        assert!(sql.contains("FROM \"public\".\"ratings\""), "{sql}");
        assert!(!sql.contains("WHERE"), "unbounded scan has no WHERE: {sql}");
    }

    #[test]
    fn test_checksum_sql_bounds_are_half_open() {
        let mut s = scan();
        s.bounds = KeyBounds::new(Some(ik(10)), Some(ik(20)));
        let sql = checksum_sql(&PostgresDialect, &s).unwrap();
        assert!(sql.contains("\"id\" >= 10"), "{sql}");
        assert!(sql.contains("\"id\" < 20"), "{sql}");
    }

    #[test]
    fn test_checksum_sql_includes_null_sentinel() {
        let sql = checksum_sql(&PostgresDialect, &scan()).unwrap();
        assert!(sql.contains("coalesce("), "{sql}");
        assert!(sql.contains("E'\\x1F'"), "{sql}");
        assert!(sql.contains("E'\\x1E'"), "{sql}");
    }

    #[test]
    fn test_scan_conditions_update_bounds_and_predicate() {
        let mut s = scan();
        s.update_column = Some("updated_at".to_string());
        s.min_update = Some(
            chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        s.where_sql = Some("status <> 'void'".to_string());
        let conds = scan_conditions(&PostgresDialect, &s);
        assert_eq!(conds.len(), 2);
        assert!(conds[0].contains("\"updated_at\" >="), "{conds:?}");
        assert!(conds[1].contains("(status <> 'void')"), "{conds:?}");
    }

    #[test]
    fn test_fetch_rows_sql_orders_by_key() {
        let sql = fetch_rows_sql(&PostgresDialect, &scan()).unwrap();
        assert!(sql.ends_with("ORDER BY \"id\""), "{sql}");
        assert!(sql.contains("to_char("), "normalized timestamp: {sql}");
    }

    #[test]
    fn test_key_range_sql_min_and_max() {
        let stmts = render_plan(&PostgresDialect, &QueryPlan::KeyRange(scan())).unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("ORDER BY \"id\" LIMIT 1"), "{}", stmts[0]);
        assert!(
            stmts[1].contains("ORDER BY \"id\" DESC LIMIT 1"),
            "{}",
            stmts[1]
        );
    }

    #[test]
    fn test_checkpoints_sql_uses_ntile() {
        let sql = checkpoints_sql(&PostgresDialect, &scan(), 31).unwrap();
        assert!(sql.contains("ntile(32) OVER (ORDER BY \"id\")"), "{sql}");
        assert!(sql.contains("DISTINCT ON (__td_tile)"), "{sql}");
        assert!(sql.ends_with("LIMIT 31"), "{sql}");
    }

    #[test]
    fn test_key_probe_sql_membership() {
        let sql = key_probe_sql(&PostgresDialect, &scan(), &[ik(5), ik(9)]).unwrap();
        assert!(sql.contains("\"id\" IN (5, 9)"), "{sql}");
    }

    #[test]
    fn test_key_probe_sql_compound_key_uses_row_values() {
        let mut s = scan();
        s.key_columns = vec![
            ("id".to_string(), ColumnType::Integer),
            ("region".to_string(), ColumnType::Text { trim: false }),
        ];
        let key = vec![KeyValue::Int(5), KeyValue::Text("us".into())];
        let sql = key_probe_sql(&PostgresDialect, &s, &[key]).unwrap();
        assert!(sql.contains("IN ((5, 'us'))"), "{sql}");
    }

    #[test]
    fn test_key_uniqueness_sql() {
        let sql = key_uniqueness_sql(&PostgresDialect, &scan()).unwrap();
        assert_eq!(
            sql,
            "SELECT count(*), count(DISTINCT \"id\") FROM \"public\".\"ratings\""
        );
    }

    #[test]
    fn test_outer_join_sql_shape() {
        let sql = outer_join_sql(&PostgresDialect, &scan(), &scan(), None).unwrap();
        assert!(sql.starts_with("WITH __td_lhs AS ("), "{sql}");
        assert!(sql.contains("FULL OUTER JOIN __td_rhs"), "{sql}");
        assert!(sql.contains("IS DISTINCT FROM"), "{sql}");
        assert!(sql.contains("WHERE __td_is_diff"), "{sql}");
        assert!(sql.ends_with("ORDER BY __td_k0"), "{sql}");
    }

    #[test]
    fn test_outer_join_sql_sampling_branches() {
        let sql = outer_join_sql(&PostgresDialect, &scan(), &scan(), Some(10)).unwrap();
        assert!(sql.contains("UNION ALL"), "{sql}");
        assert!(sql.contains("ORDER BY random() LIMIT 10"), "{sql}");
        assert!(sql.contains("__td_rp IS NULL"), "{sql}");
        assert!(sql.contains("__td_lp IS NULL"), "{sql}");
    }

    #[test]
    fn test_materialize_sql_caps_writes() {
        let target = TablePath::new(vec!["public", "diff_out"]);
        let sql =
            materialize_sql(&PostgresDialect, &scan(), &scan(), &target, 1000, false).unwrap();
        assert!(sql.starts_with("CREATE TABLE \"public\".\"diff_out\" AS"), "{sql}");
        assert!(sql.contains("WHERE __td_is_diff"), "{sql}");
        assert!(sql.ends_with("LIMIT 1000"), "{sql}");
    }

    #[test]
    fn test_materialize_sql_all_rows_drops_filter() {
        let target = TablePath::new(vec!["diff_out"]);
        let sql = materialize_sql(&PostgresDialect, &scan(), &scan(), &target, 500, true).unwrap();
        assert!(!sql.contains("WHERE __td_is_diff"), "{sql}");
    }
}
