//! Engine entry point and algorithm selection.
//!
//! [`diff_tables`] validates the comparison, binds both schemas, picks the
//! algorithm, and spawns the orchestrator onto its own thread; the caller
//! gets a lazy [`DiffStream`] immediately. All schema and configuration
//! failures happen here, before any row work starts.

use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;

use crate::db::Database;
use crate::error::DiffError;
use crate::hashdiff::{HashDiffConfig, HashDiffer, Side};
use crate::joindiff::{JoinDiffConfig, JoinDiffer};
use crate::plan::ScanSpec;
use crate::runtime::{CancelReason, CancelToken, DbPool, TaskPool};
use crate::stream::{DiffEmitter, DiffStream, RunStatus};
use crate::table::{BoundPair, TablePath, TableSegment, bind_pair};
use crate::track::Tracker;

/// Which comparison algorithm to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// JoinDiff when both sides share a connection and the dialect can
    /// outer-join; HashDiff otherwise.
    #[default]
    Auto,
    HashDiff,
    JoinDiff,
}

impl FromStr for Algorithm {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Algorithm::Auto),
            "hashdiff" => Ok(Algorithm::HashDiff),
            "joindiff" => Ok(Algorithm::JoinDiff),
            other => Err(DiffError::InvalidArgument(format!(
                "unknown algorithm {other:?} (expected auto, hashdiff, or joindiff)"
            ))),
        }
    }
}

/// Run options resolved from CLI flags and config file.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub algorithm: Algorithm,
    pub bisection_factor: usize,
    pub bisection_threshold: u64,
    pub threads_left: usize,
    pub threads_right: usize,
    pub limit: Option<u64>,
    pub strict_errors: bool,
    pub assume_unique_key: bool,
    pub sample_exclusive_rows: bool,
    pub materialize: Option<TablePath>,
    pub materialize_all_rows: bool,
    pub table_write_limit: u64,
    /// Capacity of the result channel; a full channel blocks emitters.
    pub channel_capacity: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        DiffOptions {
            algorithm: Algorithm::Auto,
            bisection_factor: 32,
            bisection_threshold: 16_384,
            threads_left: 1,
            threads_right: 1,
            limit: None,
            strict_errors: false,
            assume_unique_key: false,
            sample_exclusive_rows: false,
            materialize: None,
            materialize_all_rows: false,
            table_write_limit: 1_000,
            channel_capacity: 1_024,
        }
    }
}

impl DiffOptions {
    fn validate(&self) -> Result<(), DiffError> {
        if self.bisection_factor < 2 {
            return Err(DiffError::InvalidArgument(
                "bisection factor must be at least 2".into(),
            ));
        }
        if self.threads_left == 0 || self.threads_right == 0 {
            return Err(DiffError::InvalidArgument(
                "thread count must be at least 1".into(),
            ));
        }
        if self.table_write_limit == 0 {
            return Err(DiffError::InvalidArgument(
                "table write limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Pick the algorithm for a pair of databases.
pub fn select_algorithm(
    requested: Algorithm,
    left: &dyn Database,
    right: &dyn Database,
) -> Result<Algorithm, DiffError> {
    let same_connection = left.connection_identity() == right.connection_identity();
    let joinable = same_connection
        && left.dialect().supports_full_outer_join()
        && right.dialect().supports_full_outer_join();
    match requested {
        Algorithm::Auto => Ok(if joinable {
            Algorithm::JoinDiff
        } else {
            Algorithm::HashDiff
        }),
        Algorithm::JoinDiff if !joinable => Err(DiffError::InvalidArgument(
            "joindiff requires both tables on the same database connection \
             with FULL OUTER JOIN support"
                .into(),
        )),
        forced => Ok(forced),
    }
}

fn scan_spec(segment: &TableSegment, bound: &BoundPair, left: bool) -> ScanSpec {
    let mut columns = bound.side_columns(left);
    let compared = columns.split_off(bound.key_types.len());
    ScanSpec {
        path: segment.path.clone(),
        key_columns: columns,
        compared_columns: compared,
        bounds: segment.key_bounds.clone(),
        update_column: segment.update_column.clone(),
        min_update: segment.min_update,
        max_update: segment.max_update,
        where_sql: segment.where_sql.clone(),
    }
}

/// Compare two tables. Returns a lazy stream of diff events; schema and
/// configuration errors surface here, before any checksum is issued.
pub fn diff_tables(
    left_db: Arc<dyn Database>,
    right_db: Arc<dyn Database>,
    left: &TableSegment,
    right: &TableSegment,
    options: DiffOptions,
    tracker: Arc<dyn Tracker>,
) -> Result<DiffStream, DiffError> {
    options.validate()?;
    if (left.min_update.is_some() || left.max_update.is_some()) && left.update_column.is_none() {
        return Err(DiffError::InvalidArgument(
            "age bounds require an update column (-t/--update-column)".into(),
        ));
    }

    let left_schema = left_db.table_schema(&left.path)?;
    let right_schema = right_db.table_schema(&right.path)?;
    let bound = bind_pair(left, &left_schema, right, &right_schema)?;

    let algorithm = select_algorithm(options.algorithm, &*left_db, &*right_db)?;
    let left_scan = scan_spec(left, &bound, true);
    let right_scan = scan_spec(right, &bound, false);

    tracker.run_started(algorithm, &left_db.name(), &right_db.name());
    tracing::info!(
        algorithm = ?algorithm,
        left = %left.path,
        right = %right.path,
        "starting diff"
    );

    let cancel = CancelToken::new();
    let (tx, rx) = bounded(options.channel_capacity.max(1));
    let emitter = DiffEmitter::new(tx, cancel.clone(), options.limit);

    let orchestrator = {
        let cancel = cancel.clone();
        let tracker = tracker.clone();
        thread::Builder::new()
            .name("tablediff-orchestrator".to_string())
            .spawn(move || {
                let started = Instant::now();
                let (stats_cell, end) = run_orchestrator(
                    algorithm,
                    left_db,
                    right_db,
                    left_scan,
                    right_scan,
                    &options,
                    emitter,
                    cancel.clone(),
                );
                let result = match end {
                    RunEnd::Clean => {
                        Ok(stats_cell.snapshot(started.elapsed(), run_status(&cancel, false)))
                    }
                    RunEnd::Partial(e) => {
                        // A sacrificed subtree: the rest of the run is
                        // valid, the summary says so.
                        tracing::warn!("run incomplete: {e}");
                        Ok(stats_cell.snapshot(started.elapsed(), run_status(&cancel, true)))
                    }
                    RunEnd::Aborted(e) => Err(e),
                };
                match &result {
                    Ok(stats) => tracker.run_finished(stats),
                    Err(e) => tracker.run_failed(e),
                }
                result
            })
            .map_err(|e| DiffError::FatalBackend(format!("failed to spawn orchestrator: {e}")))?
    };

    Ok(DiffStream::new(rx, cancel, orchestrator))
}

/// How an orchestrator run ended.
enum RunEnd {
    /// Every segment terminated normally.
    Clean,
    /// The run terminated but sacrificed at least one subtree; partial
    /// results are valid and the summary is flagged incomplete.
    Partial(DiffError),
    /// The run could not complete; the stream surfaces the error.
    Aborted(DiffError),
}

#[allow(clippy::too_many_arguments)]
fn run_orchestrator(
    algorithm: Algorithm,
    left_db: Arc<dyn Database>,
    right_db: Arc<dyn Database>,
    left_scan: ScanSpec,
    right_scan: ScanSpec,
    options: &DiffOptions,
    emitter: DiffEmitter,
    cancel: CancelToken,
) -> (Arc<crate::stream::StatsCell>, RunEnd) {
    match algorithm {
        Algorithm::HashDiff => {
            let left = Side {
                pool: DbPool::new(left_db, options.threads_left, cancel.clone()),
                scan: left_scan,
            };
            let right = Side {
                pool: DbPool::new(right_db, options.threads_right, cancel.clone()),
                scan: right_scan,
            };
            let config = HashDiffConfig {
                bisection_factor: options.bisection_factor,
                bisection_threshold: options.bisection_threshold,
                strict_errors: options.strict_errors,
            };
            let differ = Arc::new(HashDiffer::new(
                left,
                right,
                config,
                emitter,
                cancel.clone(),
            ));
            let tasks = Arc::new(TaskPool::new(
                options.threads_left + options.threads_right,
            ));
            let result = differ.run(&tasks);
            let stats = differ.stats_handle();
            let end = match result {
                Ok(None) => RunEnd::Clean,
                Ok(Some(e)) if options.strict_errors => RunEnd::Aborted(e),
                Ok(Some(e)) => RunEnd::Partial(e),
                Err(e) => RunEnd::Aborted(e),
            };
            (stats, end)
        }
        Algorithm::JoinDiff => {
            let sample = options
                .sample_exclusive_rows
                .then_some(options.table_write_limit);
            let differ = JoinDiffer {
                left_pool: DbPool::new(left_db, options.threads_left, cancel.clone()),
                right_pool: DbPool::new(right_db, options.threads_right, cancel.clone()),
                left: left_scan,
                right: right_scan,
                config: JoinDiffConfig {
                    assume_unique_key: options.assume_unique_key,
                    sample_exclusive: sample,
                    materialize: options.materialize.clone(),
                    materialize_all_rows: options.materialize_all_rows,
                    table_write_limit: options.table_write_limit,
                },
                emitter,
            };
            let result = differ.run();
            let stats = differ.stats_handle();
            let end = match result {
                Ok(()) => RunEnd::Clean,
                Err(e) => RunEnd::Aborted(e),
            };
            (stats, end)
        }
        Algorithm::Auto => unreachable!("auto is resolved by select_algorithm"),
    }
}

fn run_status(cancel: &CancelToken, failed: bool) -> RunStatus {
    match cancel.reason() {
        Some(CancelReason::LimitReached) => RunStatus::LimitReached,
        Some(_) => RunStatus::Incomplete,
        None if failed => RunStatus::Incomplete,
        None => RunStatus::Complete,
    }
}
