//! Failure injection: retry of transient errors, subtree sacrifice, and
//! strict-errors abort.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::*;
use tablediff::db::memory::MemoryAdapter;
use tablediff::db::Database;
use tablediff::dialect::Dialect;
use tablediff::engine::{Algorithm, DiffOptions, diff_tables};
use tablediff::error::DiffError;
use tablediff::plan::{QueryOutput, QueryPlan};
use tablediff::stream::RunStatus;
use tablediff::table::{TablePath, TableSchema};
use tablediff::track::NoopTracker;
use tablediff::types::{KeyValue, Value};

/// Fails the first `failures` checksum queries with a transient error,
/// then behaves normally.
struct FlakyDatabase {
    inner: MemoryAdapter,
    failures: AtomicU64,
}

impl Database for FlakyDatabase {
    fn name(&self) -> String {
        self.inner.name()
    }
    fn dialect(&self) -> &dyn Dialect {
        self.inner.dialect()
    }
    fn execute(&self, plan: &QueryPlan) -> Result<QueryOutput, DiffError> {
        if matches!(plan, QueryPlan::Checksum(_)) {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DiffError::TransientBackend("connection reset".into()));
            }
        }
        self.inner.execute(plan)
    }
    fn table_schema(&self, path: &TablePath) -> Result<TableSchema, DiffError> {
        self.inner.table_schema(path)
    }
    fn connection_identity(&self) -> String {
        self.inner.connection_identity()
    }
}

/// Permanently fails row fetches for segments containing `poisoned_key`.
struct PoisonedDatabase {
    inner: MemoryAdapter,
    poisoned_key: i64,
}

impl Database for PoisonedDatabase {
    fn name(&self) -> String {
        self.inner.name()
    }
    fn dialect(&self) -> &dyn Dialect {
        self.inner.dialect()
    }
    fn execute(&self, plan: &QueryPlan) -> Result<QueryOutput, DiffError> {
        if let QueryPlan::FetchRows(scan) = plan
            && scan.bounds.contains(&vec![KeyValue::Int(self.poisoned_key)])
        {
            return Err(DiffError::FatalBackend("relation is corrupted".into()));
        }
        self.inner.execute(plan)
    }
    fn table_schema(&self, path: &TablePath) -> Result<TableSchema, DiffError> {
        self.inner.table_schema(path)
    }
    fn connection_identity(&self) -> String {
        self.inner.connection_identity()
    }
}

fn options() -> DiffOptions {
    DiffOptions {
        algorithm: Algorithm::HashDiff,
        bisection_factor: 4,
        bisection_threshold: 50,
        ..DiffOptions::default()
    }
}

fn run_with_left(
    left_db: Arc<dyn Database>,
    right_uri: &str,
) -> (Vec<tablediff::DiffEvent>, Option<DiffError>, Option<tablediff::DiffStats>) {
    let right_db = tablediff::db::connect(right_uri, 1).unwrap();
    let mut stream = diff_tables(
        left_db,
        right_db,
        &segment("ratings"),
        &segment("ratings"),
        options(),
        Arc::new(NoopTracker),
    )
    .unwrap();
    let mut events = Vec::new();
    let mut error = None;
    for item in stream.by_ref() {
        match item {
            Ok(event) => events.push(event),
            Err(e) => error = Some(e),
        }
    }
    let stats = stream.stats().ok();
    (events, error, stats)
}

#[test]
fn test_transient_checksum_failures_are_retried() {
    seed("res_flaky_l", "ratings", ratings_columns(), ratings_rows(200, "ok"));
    let mut right = ratings_rows(200, "ok");
    right[99][1] = Value::Text("changed".into());
    seed("res_flaky_r", "ratings", ratings_columns(), right);

    let left_db = Arc::new(FlakyDatabase {
        inner: MemoryAdapter::open("res_flaky_l"),
        failures: AtomicU64::new(2),
    });
    let (events, error, stats) = run_with_left(left_db, "memory://res_flaky_r");
    assert!(error.is_none(), "{error:?}");
    assert_eq!(events.len(), 2, "retry must make the run whole: {events:?}");
    assert_eq!(stats.unwrap().status, RunStatus::Complete);
}

#[test]
fn test_fatal_segment_failure_sacrifices_only_its_subtree() {
    seed("res_poison_l", "ratings", ratings_columns(), ratings_rows(200, "ok"));
    let mut right = ratings_rows(200, "ok");
    right[9][1] = Value::Text("changed".into()); // id 10, clean segment
    right[141][1] = Value::Text("changed".into()); // id 142, poisoned segment
    seed("res_poison_r", "ratings", ratings_columns(), right);

    let left_db = Arc::new(PoisonedDatabase {
        inner: MemoryAdapter::open("res_poison_l"),
        poisoned_key: 142,
    });
    let (events, error, stats) = run_with_left(left_db, "memory://res_poison_r");
    // The clean segment's diff still arrives.
    assert!(
        events.iter().any(|e| e.key == vec![KeyValue::Int(10)]),
        "{events:?}"
    );
    // The poisoned segment's diff is sacrificed; the summary says so.
    assert!(events.iter().all(|e| e.key != vec![KeyValue::Int(142)]));
    assert!(error.is_none(), "non-strict keeps the stream clean: {error:?}");
    assert_eq!(stats.unwrap().status, RunStatus::Incomplete);
}

#[test]
fn test_strict_errors_aborts_the_run() {
    seed("res_strict_l", "ratings", ratings_columns(), ratings_rows(200, "ok"));
    let mut right = ratings_rows(200, "ok");
    right[141][1] = Value::Text("changed".into());
    seed("res_strict_r", "ratings", ratings_columns(), right);

    let left_db: Arc<dyn Database> = Arc::new(PoisonedDatabase {
        inner: MemoryAdapter::open("res_strict_l"),
        poisoned_key: 142,
    });
    let right_db = tablediff::db::connect("memory://res_strict_r", 1).unwrap();
    let mut stream = diff_tables(
        left_db,
        right_db,
        &segment("ratings"),
        &segment("ratings"),
        DiffOptions {
            strict_errors: true,
            ..options()
        },
        Arc::new(NoopTracker),
    )
    .unwrap();

    let mut error = None;
    for item in stream.by_ref() {
        if let Err(e) = item {
            error = Some(e);
        }
    }
    match error {
        Some(DiffError::FatalBackend(msg)) => assert!(msg.contains("corrupted"), "{msg}"),
        other => panic!("expected FatalBackend, got {other:?}"),
    }
}

#[test]
fn test_dropping_the_stream_cancels_the_run() {
    seed("res_drop_l", "ratings", ratings_columns(), ratings_rows(500, "ok"));
    seed("res_drop_r", "ratings", ratings_columns(), vec![]);
    let left_db = tablediff::db::connect("memory://res_drop_l", 1).unwrap();
    let right_db = tablediff::db::connect("memory://res_drop_r", 1).unwrap();
    let mut stream = diff_tables(
        left_db,
        right_db,
        &segment("ratings"),
        &segment("ratings"),
        options(),
        Arc::new(NoopTracker),
    )
    .unwrap();
    let cancel = stream.cancel_token();
    let first = stream.next();
    assert!(first.is_some());
    drop(stream);
    assert!(cancel.is_cancelled());
}
