//! Column type descriptors and canonical value forms.
//!
//! Cross-engine correctness rests entirely on canonical text: the engine
//! never compares raw typed values between sides. Each compared column is
//! resolved to a [`ColumnType`], the two sides' declarations are widened to
//! a common representation by [`ColumnType::unify`], and every value is
//! rendered to a deterministic textual form — in SQL by the dialect
//! (`Dialect::normalize_expr`) and in Rust by [`Value::canonical`]. The two
//! renderings must agree character for character.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use std::cmp::Ordering;
use std::fmt;

use crate::error::DiffError;

/// Separator between column canonical forms inside a row hash.
pub const HASH_SEPARATOR: char = '\u{1E}';

/// Sentinel hashed in place of SQL NULL.
pub const NULL_SENTINEL: &str = "\u{1F}";

/// Resolved type descriptor for a compared column.
///
/// Carries exactly the information the normalizer needs to emit a
/// canonical-text fragment. Precisions are as declared by the backing
/// store; [`ColumnType::unify`] widens a pair of declarations to a common
/// representation whose canonical text is identical on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Integral key or value column.
    Integer,
    /// Textual key or value column. `trim` is set for blank-padded CHAR(n)
    /// declarations, whose trailing spaces are insignificant.
    Text { trim: bool },
    /// UUID column; canonical form is lowercase hyphenated text.
    Uuid,
    /// Timestamp with fractional-second `precision` (0..=6).
    Timestamp { precision: u8, with_timezone: bool },
    /// Calendar date; canonical form is `YYYY-MM-DD`.
    Date,
    /// Exact numeric with declared precision and scale.
    Decimal { precision: u8, scale: u8 },
    /// Binary float; `precision` bounds the significant fractional digits
    /// of the canonical form.
    Float { precision: u8 },
    Boolean,
    /// JSON document rendered through the dialect's deterministic form.
    Json,
    /// A type the engine cannot canonicalize. Carries the raw declaration
    /// so the schema binder can name it in the error.
    Unsupported { repr: String },
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::Text { trim: false } => write!(f, "text"),
            ColumnType::Text { trim: true } => write!(f, "char"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Timestamp {
                precision,
                with_timezone,
            } => {
                if *with_timezone {
                    write!(f, "timestamptz({precision})")
                } else {
                    write!(f, "timestamp({precision})")
                }
            }
            ColumnType::Date => write!(f, "date"),
            ColumnType::Decimal { precision, scale } => {
                write!(f, "decimal({precision},{scale})")
            }
            ColumnType::Float { precision } => write!(f, "float({precision})"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Unsupported { repr } => write!(f, "{repr}"),
        }
    }
}

impl ColumnType {
    /// Whether this type may serve as a key column.
    pub fn is_key_type(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::Text { .. } | ColumnType::Uuid
        )
    }

    /// Whether this type may serve as the update (change-detection) column.
    pub fn is_update_type(&self) -> bool {
        matches!(
            self,
            ColumnType::Timestamp { .. } | ColumnType::Date | ColumnType::Integer
        )
    }

    /// Widen two declarations of the same column to a common representation
    /// whose canonical text is identical for equal logical values.
    ///
    /// Timestamps widen to the coarser precision; decimals and floats to
    /// the larger scale. Structurally incompatible kinds are a
    /// [`DiffError::TypeMismatch`].
    pub fn unify(&self, other: &ColumnType, column: &str) -> Result<ColumnType, DiffError> {
        use ColumnType::*;
        let unified = match (self, other) {
            (Integer, Integer) => Integer,
            (Text { trim: a }, Text { trim: b }) => Text { trim: *a || *b },
            (Uuid, Uuid) => Uuid,
            // A UUID stored as text on one side compares as lowercase text.
            (Uuid, Text { .. }) | (Text { .. }, Uuid) => Uuid,
            (
                Timestamp {
                    precision: p1,
                    with_timezone: tz1,
                },
                Timestamp {
                    precision: p2,
                    with_timezone: tz2,
                },
            ) => Timestamp {
                precision: (*p1).min(*p2),
                with_timezone: *tz1 || *tz2,
            },
            (Date, Date) => Date,
            (
                Decimal {
                    precision: p1,
                    scale: s1,
                },
                Decimal {
                    precision: p2,
                    scale: s2,
                },
            ) => Decimal {
                precision: (*p1).max(*p2),
                scale: (*s1).max(*s2),
            },
            (Float { precision: p1 }, Float { precision: p2 }) => Float {
                precision: (*p1).max(*p2),
            },
            // An exact numeric against a float compares at float precision.
            (Float { precision }, Decimal { scale, .. })
            | (Decimal { scale, .. }, Float { precision }) => Float {
                precision: (*precision).max(*scale),
            },
            (Boolean, Boolean) => Boolean,
            (Json, Json) => Json,
            (a, b) => {
                return Err(DiffError::TypeMismatch {
                    column: column.to_string(),
                    left: a.to_string(),
                    right: b.to_string(),
                });
            }
        };
        Ok(unified)
    }
}

// ── Key values ─────────────────────────────────────────────────────────────

/// One component of a key tuple, in a form with a total order shared by
/// both engines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Int(i64),
    /// Textual and UUID keys; UUIDs are lowercased before entering a key.
    Text(String),
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Text(a), KeyValue::Text(b)) => a.cmp(b),
            // Mixed tuples never occur after the schema binder has run;
            // order integers first so Ord stays total.
            (KeyValue::Int(_), KeyValue::Text(_)) => Ordering::Less,
            (KeyValue::Text(_), KeyValue::Int(_)) => Ordering::Greater,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl serde::Serialize for KeyValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            KeyValue::Int(v) => serializer.serialize_i64(*v),
            KeyValue::Text(v) => serializer.serialize_str(v),
        }
    }
}

/// A full key: one [`KeyValue`] per key column, compared lexicographically.
pub type Key = Vec<KeyValue>;

/// Render a key for human-readable output.
pub fn format_key(key: &Key) -> String {
    key.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Typed values (in-memory adapter and tests) ─────────────────────────────

/// A typed cell value. The SQL adapters never construct these — they read
/// canonical text straight off the wire. The in-memory adapter stores them
/// and canonicalizes through the same rules the dialects emit as SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Uuid(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    /// Exact numeric kept as its literal text (e.g. `"3.1400"`).
    Decimal(String),
    Float(f64),
    Bool(bool),
    Json(String),
}

impl Value {
    /// Render the canonical text of this value under the given unified
    /// column type. Mirrors `Dialect::normalize_expr` exactly.
    pub fn canonical(&self, ty: &ColumnType) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(v) => match ty {
                ColumnType::Decimal { scale, .. } => canonical_decimal(&v.to_string(), *scale),
                ColumnType::Float { precision } => Some(canonical_float(*v as f64, *precision)),
                _ => Some(v.to_string()),
            },
            Value::Text(v) => match ty {
                ColumnType::Uuid => Some(v.to_lowercase()),
                ColumnType::Text { trim: true } => Some(v.trim_end_matches(' ').to_string()),
                _ => Some(v.clone()),
            },
            Value::Uuid(v) => Some(v.to_lowercase()),
            Value::Timestamp(ts) => {
                let precision = match ty {
                    ColumnType::Timestamp { precision, .. } => *precision,
                    _ => 6,
                };
                Some(canonical_timestamp(ts, precision))
            }
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Decimal(raw) => {
                let scale = match ty {
                    ColumnType::Decimal { scale, .. } => *scale,
                    ColumnType::Float { precision } => {
                        return Some(canonical_float(raw.parse().ok()?, *precision));
                    }
                    _ => 0,
                };
                canonical_decimal(raw, scale)
            }
            Value::Float(v) => {
                let precision = match ty {
                    ColumnType::Float { precision } => *precision,
                    ColumnType::Decimal { scale, .. } => *scale,
                    _ => 6,
                };
                Some(canonical_float(*v, precision))
            }
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Json(v) => Some(v.clone()),
        }
    }

    /// Convert to a key component, if this value is of a key kind.
    pub fn to_key_value(&self) -> Option<KeyValue> {
        match self {
            Value::Int(v) => Some(KeyValue::Int(*v)),
            Value::Text(v) => Some(KeyValue::Text(v.clone())),
            Value::Uuid(v) => Some(KeyValue::Text(v.to_lowercase())),
            _ => None,
        }
    }
}

// ── Canonical text rules ───────────────────────────────────────────────────

/// Canonical timestamp text: UTC, `YYYY-MM-DD HH:MM:SS` plus a fractional
/// part truncated to `precision` digits (omitted when precision is 0).
pub fn canonical_timestamp(ts: &DateTime<Utc>, precision: u8) -> String {
    let full = ts.to_rfc3339_opts(SecondsFormat::Micros, true);
    // RFC3339 "2024-01-01T00:00:00.000000Z" → "2024-01-01 00:00:00.000000"
    let full = full.trim_end_matches('Z').replacen('T', " ", 1);
    let precision = precision.min(6) as usize;
    if precision == 0 {
        full[..19].to_string()
    } else {
        full[..19 + 1 + precision].to_string()
    }
}

/// Canonical decimal text with exactly `scale` fractional digits.
///
/// Accepts any plain decimal literal. The fractional part is padded with
/// zeros or truncated to `scale`; a sign is dropped when every remaining
/// digit is zero. Returns `None` for text that is not a decimal literal.
pub fn canonical_decimal(raw: &str, scale: u8) -> Option<String> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let int_part = int_part.trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };

    let scale = scale as usize;
    let mut frac: String = frac_part.chars().take(scale).collect();
    while frac.len() < scale {
        frac.push('0');
    }

    let body = if scale == 0 {
        int_part.to_string()
    } else {
        format!("{int_part}.{frac}")
    };
    let all_zero = body.chars().all(|c| c == '0' || c == '.');
    if negative && !all_zero {
        Some(format!("-{body}"))
    } else {
        Some(body)
    }
}

/// Canonical float text: rendered at `precision` fractional digits, then
/// stripped of trailing zeros (and of the dot when nothing follows it).
pub fn canonical_float(v: f64, precision: u8) -> String {
    let rendered = format!("{:.*}", precision as usize, v);
    if !rendered.contains('.') {
        return rendered;
    }
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    let trimmed = if trimmed.is_empty() || trimmed == "-" {
        "0"
    } else {
        trimmed
    };
    // Avoid the float minus-zero artifact.
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Concatenate canonical column forms into the row-hash input, with the
/// NULL sentinel substituted for absent values.
pub fn hash_input(canonical_columns: &[Option<String>]) -> String {
    let mut out = String::new();
    for (i, col) in canonical_columns.iter().enumerate() {
        if i > 0 {
            out.push(HASH_SEPARATOR);
        }
        match col {
            Some(text) => out.push_str(text),
            None => out.push_str(NULL_SENTINEL),
        }
    }
    out
}
