//! Cross-type normalization scenarios: values that differ only by lossless
//! re-encoding must never surface as diffs.

mod common;

use chrono::{TimeZone, Utc};
use common::*;
use tablediff::engine::{Algorithm, DiffOptions};
use tablediff::types::{ColumnType, Value};
use tablediff::{TablePath, TableSegment};

fn seg(table: &str, columns: Vec<&str>) -> TableSegment {
    TableSegment::new(TablePath::new(vec![table])).with_extra_columns(columns)
}

fn hashdiff() -> DiffOptions {
    DiffOptions {
        algorithm: Algorithm::HashDiff,
        ..DiffOptions::default()
    }
}

#[test]
fn test_decimal_precision_mismatch_is_not_a_difference() {
    // Scenario S3: DECIMAL(10,2) 3.14 vs DECIMAL(10,4) 3.1400.
    seed(
        "norm_dec_l",
        "orders",
        vec![
            ("id".to_string(), ColumnType::Integer),
            (
                "amount".to_string(),
                ColumnType::Decimal {
                    precision: 10,
                    scale: 2,
                },
            ),
        ],
        vec![vec![Value::Int(1), Value::Decimal("3.14".into())]],
    );
    seed(
        "norm_dec_r",
        "orders",
        vec![
            ("id".to_string(), ColumnType::Integer),
            (
                "amount".to_string(),
                ColumnType::Decimal {
                    precision: 10,
                    scale: 4,
                },
            ),
        ],
        vec![vec![Value::Int(1), Value::Decimal("3.1400".into())]],
    );

    let outcome = run_diff(
        "memory://norm_dec_l",
        "memory://norm_dec_r",
        &seg("orders", vec!["amount"]),
        &seg("orders", vec!["amount"]),
        hashdiff(),
    );
    assert!(outcome.events.is_empty(), "{:?}", outcome.events);
    assert!(outcome.error.is_none());
}

#[test]
fn test_timestamp_precision_and_timezone_mismatch_is_not_a_difference() {
    // Scenario S4: TIMESTAMP(6) naive midnight vs TIMESTAMPTZ(0) UTC
    // midnight are the same instant.
    let instant = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    seed(
        "norm_ts_l",
        "events",
        vec![
            ("id".to_string(), ColumnType::Integer),
            (
                "created_at".to_string(),
                ColumnType::Timestamp {
                    precision: 6,
                    with_timezone: false,
                },
            ),
        ],
        vec![vec![Value::Int(1), Value::Timestamp(instant)]],
    );
    seed(
        "norm_ts_r",
        "events",
        vec![
            ("id".to_string(), ColumnType::Integer),
            (
                "created_at".to_string(),
                ColumnType::Timestamp {
                    precision: 0,
                    with_timezone: true,
                },
            ),
        ],
        vec![vec![Value::Int(1), Value::Timestamp(instant)]],
    );

    let outcome = run_diff(
        "memory://norm_ts_l",
        "memory://norm_ts_r",
        &seg("events", vec!["created_at"]),
        &seg("events", vec!["created_at"]),
        hashdiff(),
    );
    assert!(outcome.events.is_empty(), "{:?}", outcome.events);
}

#[test]
fn test_sub_second_drift_is_hidden_by_coarser_precision() {
    // With one side declared at precision 0, fractional drift vanishes.
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let drifted = Utc
        .timestamp_opt(base.timestamp(), 250_000_000)
        .single()
        .unwrap();
    let schema_p6 = vec![
        ("id".to_string(), ColumnType::Integer),
        (
            "at".to_string(),
            ColumnType::Timestamp {
                precision: 6,
                with_timezone: false,
            },
        ),
    ];
    let schema_p0 = vec![
        ("id".to_string(), ColumnType::Integer),
        (
            "at".to_string(),
            ColumnType::Timestamp {
                precision: 0,
                with_timezone: false,
            },
        ),
    ];
    seed(
        "norm_drift_l",
        "t",
        schema_p6,
        vec![vec![Value::Int(1), Value::Timestamp(drifted)]],
    );
    seed(
        "norm_drift_r",
        "t",
        schema_p0,
        vec![vec![Value::Int(1), Value::Timestamp(base)]],
    );
    let outcome = run_diff(
        "memory://norm_drift_l",
        "memory://norm_drift_r",
        &seg("t", vec!["at"]),
        &seg("t", vec!["at"]),
        hashdiff(),
    );
    assert!(outcome.events.is_empty(), "{:?}", outcome.events);
}

#[test]
fn test_boolean_encodings_agree() {
    let columns = vec![
        ("id".to_string(), ColumnType::Integer),
        ("active".to_string(), ColumnType::Boolean),
    ];
    seed(
        "norm_bool_l",
        "t",
        columns.clone(),
        vec![
            vec![Value::Int(1), Value::Bool(true)],
            vec![Value::Int(2), Value::Bool(false)],
        ],
    );
    seed(
        "norm_bool_r",
        "t",
        columns,
        vec![
            vec![Value::Int(1), Value::Bool(true)],
            vec![Value::Int(2), Value::Bool(false)],
        ],
    );
    let outcome = run_diff(
        "memory://norm_bool_l",
        "memory://norm_bool_r",
        &seg("t", vec!["active"]),
        &seg("t", vec!["active"]),
        hashdiff(),
    );
    assert!(outcome.events.is_empty());
}

#[test]
fn test_uuid_case_is_not_a_difference() {
    let columns = vec![
        ("id".to_string(), ColumnType::Integer),
        ("guid".to_string(), ColumnType::Uuid),
    ];
    seed(
        "norm_uuid_l",
        "t",
        columns.clone(),
        vec![vec![
            Value::Int(1),
            Value::Uuid("550E8400-E29B-41D4-A716-446655440000".into()),
        ]],
    );
    seed(
        "norm_uuid_r",
        "t",
        columns,
        vec![vec![
            Value::Int(1),
            Value::Uuid("550e8400-e29b-41d4-a716-446655440000".into()),
        ]],
    );
    let outcome = run_diff(
        "memory://norm_uuid_l",
        "memory://norm_uuid_r",
        &seg("t", vec!["guid"]),
        &seg("t", vec!["guid"]),
        hashdiff(),
    );
    assert!(outcome.events.is_empty());
}

#[test]
fn test_float_trailing_zeros_are_not_a_difference() {
    let columns = vec![
        ("id".to_string(), ColumnType::Integer),
        ("score".to_string(), ColumnType::Float { precision: 6 }),
    ];
    seed(
        "norm_float_l",
        "t",
        columns.clone(),
        vec![vec![Value::Int(1), Value::Float(1.5)]],
    );
    seed(
        "norm_float_r",
        "t",
        columns,
        vec![vec![Value::Int(1), Value::Decimal("1.500".into())]],
    );
    let outcome = run_diff(
        "memory://norm_float_l",
        "memory://norm_float_r",
        &seg("t", vec!["score"]),
        &seg("t", vec!["score"]),
        hashdiff(),
    );
    assert!(outcome.events.is_empty(), "{:?}", outcome.events);
}

#[test]
fn test_age_filter_hides_recent_divergence() {
    // Scenario S5: the divergent rows are all recent; an update-column
    // bound that excludes them yields a clean diff.
    let now = Utc::now();
    let old = now - chrono::Duration::hours(2);
    let recent = now - chrono::Duration::seconds(30);
    let columns = vec![
        ("id".to_string(), ColumnType::Integer),
        (
            "updated_at".to_string(),
            ColumnType::Timestamp {
                precision: 6,
                with_timezone: true,
            },
        ),
        ("status".to_string(), ColumnType::Text { trim: false }),
    ];
    let rows = |drifted: bool| -> Vec<Vec<Value>> {
        let mut out = Vec::new();
        for id in 1..=50i64 {
            out.push(vec![
                Value::Int(id),
                Value::Timestamp(old),
                Value::Text("stable".into()),
            ]);
        }
        for id in 51..=60i64 {
            let status = if drifted { "drifted" } else { "fresh" };
            out.push(vec![
                Value::Int(id),
                Value::Timestamp(recent),
                Value::Text(status.into()),
            ]);
        }
        out
    };
    seed("norm_age_l", "t", columns.clone(), rows(false));
    seed("norm_age_r", "t", columns, rows(true));

    let filtered = TableSegment::new(TablePath::new(vec!["t"]))
        .with_update_column("updated_at")
        .with_extra_columns(vec!["status"])
        .with_update_bounds(None, Some(now - chrono::Duration::minutes(5)));
    let outcome = run_diff(
        "memory://norm_age_l",
        "memory://norm_age_r",
        &filtered,
        &filtered.clone(),
        hashdiff(),
    );
    assert!(outcome.events.is_empty(), "{:?}", outcome.events);

    // Without the bound every divergent row surfaces.
    let unfiltered = TableSegment::new(TablePath::new(vec!["t"]))
        .with_update_column("updated_at")
        .with_extra_columns(vec!["status"]);
    let outcome = run_diff(
        "memory://norm_age_l",
        "memory://norm_age_r",
        &unfiltered,
        &unfiltered.clone(),
        hashdiff(),
    );
    assert_eq!(outcome.events.len(), 20, "{:?}", outcome.events);
}

#[test]
fn test_algorithm_parity_on_eligible_datasets() {
    // Property 9: hashdiff and joindiff agree on the diff multiset.
    let ns = "memory://parity";
    seed("parity", "l", ratings_columns(), ratings_rows(800, "ok"));
    let mut right = ratings_rows(800, "ok");
    right.retain(|row| row[0] != Value::Int(100));
    right[499][1] = Value::Text("moved".into());
    right.push(vec![Value::Int(801), Value::Text("new".into())]);
    seed("parity", "r", ratings_columns(), right);

    let left_seg = segment("l");
    let right_seg = segment("r");
    let hash = run_diff(
        ns,
        ns,
        &left_seg,
        &right_seg,
        DiffOptions {
            algorithm: Algorithm::HashDiff,
            bisection_factor: 4,
            bisection_threshold: 50,
            ..DiffOptions::default()
        },
    );
    let join = run_diff(
        ns,
        ns,
        &left_seg,
        &right_seg,
        DiffOptions {
            algorithm: Algorithm::JoinDiff,
            ..DiffOptions::default()
        },
    );
    assert!(hash.error.is_none());
    assert!(join.error.is_none());
    assert_eq!(hash.multiset(), join.multiset());
    assert_eq!(hash.events.len(), 4);
}
