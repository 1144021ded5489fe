//! Shared fixtures for engine integration tests.
//!
//! Tests run the full engine against the in-process memory adapter. Each
//! test uses its own namespace so the process-global store never bleeds
//! state between parallel tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use tablediff::db;
use tablediff::db::memory::create_table;
use tablediff::engine::{DiffOptions, diff_tables};
use tablediff::error::DiffError;
use tablediff::stream::{DiffEvent, DiffStats};
use tablediff::table::{TablePath, TableSegment};
use tablediff::track::NoopTracker;
use tablediff::types::{ColumnType, Value};

pub fn ratings_columns() -> Vec<(String, ColumnType)> {
    vec![
        ("id".to_string(), ColumnType::Integer),
        ("status".to_string(), ColumnType::Text { trim: false }),
    ]
}

/// `n` rows keyed 1..=n with a constant status column.
pub fn ratings_rows(n: i64, status: &str) -> Vec<Vec<Value>> {
    (1..=n)
        .map(|i| vec![Value::Int(i), Value::Text(status.to_string())])
        .collect()
}

pub fn seed(namespace: &str, table: &str, columns: Vec<(String, ColumnType)>, rows: Vec<Vec<Value>>) {
    create_table(namespace, &TablePath::new(vec![table]), columns, rows);
}

pub fn segment(table: &str) -> TableSegment {
    TableSegment::new(TablePath::new(vec![table])).with_extra_columns(vec!["status"])
}

pub struct RunOutcome {
    pub events: Vec<DiffEvent>,
    pub error: Option<DiffError>,
    pub stats: Option<DiffStats>,
}

impl RunOutcome {
    pub fn stats(&self) -> &DiffStats {
        self.stats.as_ref().expect("run produced no stats")
    }

    /// `(sign, key)` pairs in emission order.
    pub fn signed_keys(&self) -> Vec<(tablediff::Sign, Vec<tablediff::types::KeyValue>)> {
        self.events
            .iter()
            .map(|e| (e.sign, e.key.clone()))
            .collect()
    }

    /// The diff multiset, order-insensitive.
    pub fn multiset(&self) -> Vec<String> {
        let mut set: Vec<String> = self
            .events
            .iter()
            .map(|e| format!("{} {:?} {:?}", e.sign, e.key, e.row))
            .collect();
        set.sort();
        set
    }
}

/// Run a diff over memory adapters and drain the stream.
pub fn run_diff(
    left_uri: &str,
    right_uri: &str,
    left: &TableSegment,
    right: &TableSegment,
    options: DiffOptions,
) -> RunOutcome {
    let left_db = db::connect(left_uri, options.threads_left).expect("left adapter");
    let right_db = db::connect(right_uri, options.threads_right).expect("right adapter");
    let mut stream = diff_tables(
        left_db,
        right_db,
        left,
        right,
        options,
        Arc::new(NoopTracker),
    )
    .expect("diff_tables pre-flight");

    let mut events = Vec::new();
    let mut error = None;
    for item in stream.by_ref() {
        match item {
            Ok(event) => events.push(event),
            Err(e) => error = Some(e),
        }
    }
    let stats = stream.stats().ok();
    RunOutcome {
        events,
        error,
        stats,
    }
}

/// Options tuned so small fixtures still exercise real bisection.
pub fn small_bisection_options() -> DiffOptions {
    DiffOptions {
        bisection_factor: 4,
        bisection_threshold: 100,
        threads_left: 2,
        threads_right: 2,
        ..DiffOptions::default()
    }
}
