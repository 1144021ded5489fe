//! Dialect capabilities and the PostgreSQL dialect.
//!
//! A [`Dialect`] supplies the per-engine SQL fragments the plan renderer
//! composes: identifier quoting, literals, the canonical-text normalization
//! fragment for each column type, a total-order expression for keys, and
//! the 64-bit row hash plus its associative fold.
//!
//! The normalization fragments are where cross-engine equality is decided:
//! a fragment must yield, for equal logical values, text identical to every
//! other dialect's fragment and to [`crate::types::Value::canonical`].

use chrono::{DateTime, Utc};

use crate::error::DiffError;
use crate::types::{ColumnType, KeyValue};

/// Engine-specific SQL building blocks.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Quote an identifier.
    fn quote(&self, ident: &str) -> String;

    /// Render a string literal.
    fn string_literal(&self, text: &str) -> String;

    /// Whether the engine can run `FULL OUTER JOIN` (joindiff eligibility).
    fn supports_full_outer_join(&self) -> bool;

    /// Canonical-text fragment for a column under its unified type (§4.1).
    /// Yields SQL producing exactly the canonical text, or NULL for NULL.
    fn normalize_expr(&self, column: &str, ty: &ColumnType) -> Result<String, DiffError>;

    /// Fragment usable in `ORDER BY` and key comparisons that produces a
    /// total order consistent across engines (byte order for text).
    fn order_expr(&self, column: &str, ty: &ColumnType) -> String;

    /// 64-bit row-hash expression over a concatenated text expression.
    fn row_hash_expr(&self, concat_expr: &str) -> String;

    /// Associative aggregate fold of row hashes; must yield 0 on an empty
    /// set.
    fn checksum_fold_expr(&self, hash_expr: &str) -> String;

    /// Literal for a UTC timestamp, comparable against the update column.
    fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String;

    /// Literal for one key component.
    fn key_literal(&self, kv: &KeyValue) -> String {
        match kv {
            KeyValue::Int(v) => v.to_string(),
            KeyValue::Text(v) => self.string_literal(v),
        }
    }

    /// Expression for random row ordering (exclusive-row sampling).
    fn random_expr(&self) -> String;

    /// Separator literal used between canonical column forms in the row
    /// hash input.
    fn hash_separator_literal(&self) -> String;

    /// Literal hashed in place of NULL.
    fn null_sentinel_literal(&self) -> String;
}

// ── PostgreSQL ─────────────────────────────────────────────────────────────

/// The PostgreSQL dialect. Requires server version 14+ for `bit_xor`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn string_literal(&self, text: &str) -> String {
        format!("'{}'", text.replace('\'', "''"))
    }

    fn supports_full_outer_join(&self) -> bool {
        true
    }

    fn normalize_expr(&self, column: &str, ty: &ColumnType) -> Result<String, DiffError> {
        let col = self.quote(column);
        let expr = match ty {
            ColumnType::Integer => format!("({col})::text"),
            ColumnType::Text { trim: false } => format!("({col})::text"),
            ColumnType::Text { trim: true } => format!("rtrim(({col})::text, ' ')"),
            ColumnType::Uuid => format!("lower(({col})::text)"),
            ColumnType::Timestamp {
                precision,
                with_timezone,
            } => {
                let instant = if *with_timezone {
                    format!("({col}) AT TIME ZONE 'UTC'")
                } else {
                    format!("({col})")
                };
                if *precision == 0 {
                    format!("to_char({instant}, 'YYYY-MM-DD HH24:MI:SS')")
                } else {
                    format!(
                        "left(to_char({instant}, 'YYYY-MM-DD HH24:MI:SS.US'), {})",
                        20 + (*precision).min(6) as usize
                    )
                }
            }
            ColumnType::Date => format!("to_char({col}, 'YYYY-MM-DD')"),
            ColumnType::Decimal { scale, .. } => {
                format!("(({col})::numeric(38, {scale}))::text")
            }
            ColumnType::Float { precision } => {
                let fixed = format!("(({col})::numeric(38, {precision}))::text");
                format!(
                    "(CASE WHEN {fixed} LIKE '%.%' \
                     THEN rtrim(rtrim({fixed}, '0'), '.') ELSE {fixed} END)"
                )
            }
            ColumnType::Boolean => format!("(({col})::int)::text"),
            ColumnType::Json => format!("(({col})::jsonb)::text"),
            ColumnType::Unsupported { repr } => {
                return Err(DiffError::UnsupportedComparedType {
                    column: column.to_string(),
                    type_repr: repr.clone(),
                });
            }
        };
        Ok(expr)
    }

    fn order_expr(&self, column: &str, ty: &ColumnType) -> String {
        let col = self.quote(column);
        match ty {
            ColumnType::Integer => col,
            ColumnType::Uuid => format!("lower(({col})::text) COLLATE \"C\""),
            _ => format!("({col})::text COLLATE \"C\""),
        }
    }

    fn row_hash_expr(&self, concat_expr: &str) -> String {
        format!("('x' || substr(md5({concat_expr}), 1, 16))::bit(64)::bigint")
    }

    fn checksum_fold_expr(&self, hash_expr: &str) -> String {
        format!("coalesce(bit_xor({hash_expr}), 0)")
    }

    fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String {
        format!(
            "'{}'::timestamptz",
            ts.format("%Y-%m-%d %H:%M:%S%.6f+00")
        )
    }

    fn random_expr(&self) -> String {
        "random()".to_string()
    }

    fn hash_separator_literal(&self) -> String {
        "E'\\x1E'".to_string()
    }

    fn null_sentinel_literal(&self) -> String {
        "E'\\x1F'".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg() -> PostgresDialect {
        PostgresDialect
    }

    // ── quoting and literals ────────────────────────────────────────

    #[test]
    fn test_quote_ident() {
        assert_eq!(pg().quote("name"), "\"name\"");
        assert_eq!(pg().quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_string_literal_escapes_quotes() {
        assert_eq!(pg().string_literal("o'clock"), "'o''clock'");
    }

    #[test]
    fn test_key_literal() {
        assert_eq!(pg().key_literal(&KeyValue::Int(42)), "42");
        assert_eq!(pg().key_literal(&KeyValue::Text("ab".into())), "'ab'");
    }

    // ── normalization fragments ─────────────────────────────────────

    #[test]
    fn test_normalize_integer() {
        let sql = pg().normalize_expr("id", &ColumnType::Integer).unwrap();
        assert_eq!(sql, "(\"id\")::text");
    }

    #[test]
    fn test_normalize_boolean_renders_int() {
        let sql = pg().normalize_expr("active", &ColumnType::Boolean).unwrap();
        assert_eq!(sql, "((\"active\")::int)::text");
    }

    #[test]
    fn test_normalize_timestamp_precision_zero_has_no_fraction() {
        let ty = ColumnType::Timestamp {
            precision: 0,
            with_timezone: false,
        };
        let sql = pg().normalize_expr("created_at", &ty).unwrap();
        assert!(sql.contains("'YYYY-MM-DD HH24:MI:SS'"), "{sql}");
        assert!(!sql.contains(".US"), "{sql}");
    }

    #[test]
    fn test_normalize_timestamp_truncates_to_precision() {
        let ty = ColumnType::Timestamp {
            precision: 3,
            with_timezone: false,
        };
        let sql = pg().normalize_expr("created_at", &ty).unwrap();
        // 19 chars of date-time, the dot, then 3 fractional digits.
        assert!(sql.starts_with("left("), "{sql}");
        assert!(sql.ends_with(", 23)"), "{sql}");
    }

    #[test]
    fn test_normalize_timestamptz_shifts_to_utc() {
        let ty = ColumnType::Timestamp {
            precision: 6,
            with_timezone: true,
        };
        let sql = pg().normalize_expr("created_at", &ty).unwrap();
        assert!(sql.contains("AT TIME ZONE 'UTC'"), "{sql}");
    }

    #[test]
    fn test_normalize_decimal_uses_unified_scale() {
        let ty = ColumnType::Decimal {
            precision: 10,
            scale: 4,
        };
        let sql = pg().normalize_expr("amount", &ty).unwrap();
        assert!(sql.contains("numeric(38, 4)"), "{sql}");
    }

    #[test]
    fn test_normalize_float_trims_trailing_zeros_without_mangling_integers() {
        let ty = ColumnType::Float { precision: 6 };
        let sql = pg().normalize_expr("rating", &ty).unwrap();
        // The LIKE guard keeps "100" from becoming "1".
        assert!(sql.contains("LIKE '%.%'"), "{sql}");
        assert!(sql.contains("rtrim(rtrim("), "{sql}");
    }

    #[test]
    fn test_normalize_uuid_lowercases() {
        let sql = pg().normalize_expr("guid", &ColumnType::Uuid).unwrap();
        assert_eq!(sql, "lower((\"guid\")::text)");
    }

    #[test]
    fn test_normalize_unsupported_type_errors() {
        let err = pg()
            .normalize_expr(
                "blob",
                &ColumnType::Unsupported {
                    repr: "bytea".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DiffError::UnsupportedComparedType { .. }));
    }

    // ── ordering and hashing ────────────────────────────────────────

    #[test]
    fn test_order_expr_text_uses_byte_collation() {
        let sql = pg().order_expr("name", &ColumnType::Text { trim: false });
        assert!(sql.contains("COLLATE \"C\""), "{sql}");
    }

    #[test]
    fn test_order_expr_integer_is_raw() {
        assert_eq!(pg().order_expr("id", &ColumnType::Integer), "\"id\"");
    }

    #[test]
    fn test_row_hash_takes_md5_low_64_bits() {
        let sql = pg().row_hash_expr("x");
        assert_eq!(sql, "('x' || substr(md5(x), 1, 16))::bit(64)::bigint");
    }

    #[test]
    fn test_checksum_fold_is_xor_with_empty_default() {
        let sql = pg().checksum_fold_expr("h");
        assert_eq!(sql, "coalesce(bit_xor(h), 0)");
    }

    #[test]
    fn test_timestamp_literal_is_utc() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let lit = pg().timestamp_literal(&ts);
        assert_eq!(lit, "'2024-01-01 12:00:00.000000+00'::timestamptz");
    }
}
