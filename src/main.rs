//! The `tablediff` CLI.
//!
//! ```text
//! tablediff DB1_URI TABLE1 DB2_URI TABLE2 [options]
//! tablediff --conf diffs.toml --run nightly [overrides]
//! ```
//!
//! Exit codes: 0 no differences, 1 differences found, 2 user error,
//! 3 backend error.

use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tablediff::config::ConfigFile;
use tablediff::db::{self, Database};
use tablediff::dialect::Dialect;
use tablediff::duration::age_to_instant;
use tablediff::engine::{self, Algorithm, DiffOptions};
use tablediff::error::DiffError;
use tablediff::plan::{QueryOutput, QueryPlan};
use tablediff::sqlgen::render_plan;
use tablediff::stream::{DiffStats, RunStatus};
use tablediff::table::{TablePath, TableSegment, TableSchema};
use tablediff::track::{LogTracker, NoopTracker, Tracker};

#[derive(Debug, Parser)]
#[command(
    name = "tablediff",
    version,
    about = "Diff rows of two tables, in the same database or across engines"
)]
struct Cli {
    /// Connection string (or config database name) for the left side.
    db1: Option<String>,
    /// Left table, optionally schema-qualified.
    table1: Option<String>,
    /// Connection string (or config database name) for the right side.
    db2: Option<String>,
    /// Right table, optionally schema-qualified.
    table2: Option<String>,

    /// Key column; repeat for compound keys.
    #[arg(short = 'k', long = "key-columns", value_name = "COLUMN")]
    key_columns: Vec<String>,
    /// Column whose change marks a row as updated (usually a timestamp).
    #[arg(short = 't', long, value_name = "COLUMN")]
    update_column: Option<String>,
    /// Extra compared column; repeatable, supports % wildcards.
    #[arg(short = 'c', long = "columns", value_name = "PATTERN")]
    columns: Vec<String>,
    /// Extra WHERE predicate applied to both sides.
    #[arg(short = 'w', long = "where", value_name = "PREDICATE")]
    where_predicate: Option<String>,
    /// Ignore rows younger than this (e.g. 5min, 2h, 1d).
    #[arg(long, value_name = "AGE")]
    min_age: Option<String>,
    /// Ignore rows older than this.
    #[arg(long, value_name = "AGE")]
    max_age: Option<String>,

    /// auto, hashdiff, or joindiff.
    #[arg(short = 'a', long)]
    algorithm: Option<String>,
    /// Segments per bisection level (hashdiff).
    #[arg(long, value_name = "N")]
    bisection_factor: Option<usize>,
    /// Row count below which a segment is compared locally (hashdiff).
    #[arg(long, value_name = "ROWS")]
    bisection_threshold: Option<u64>,

    /// Materialize joindiff results into this table; %t expands to a
    /// UTC timestamp.
    #[arg(short = 'm', long, value_name = "TABLE")]
    materialize: Option<String>,
    /// Skip key-uniqueness verification (joindiff).
    #[arg(long)]
    assume_unique_key: bool,
    /// Sample rows existing on one side only instead of emitting all.
    #[arg(long)]
    sample_exclusive_rows: bool,
    /// Materialize matching rows too, not only differing ones.
    #[arg(long)]
    materialize_all_rows: bool,
    /// Row cap for materialization writes.
    #[arg(long, value_name = "ROWS")]
    table_write_limit: Option<u64>,

    /// Print summary statistics.
    #[arg(short = 's', long)]
    stats: bool,
    /// Emit JSONL diff records (and a JSON stats summary).
    #[arg(long)]
    json: bool,
    /// Stop after this many diff events.
    #[arg(short = 'l', long, value_name = "N")]
    limit: Option<u64>,
    /// Debug-level logging.
    #[arg(short = 'v', long)]
    verbose: bool,
    /// Trace-level logging.
    #[arg(short = 'd', long)]
    debug: bool,
    /// Print each query and ask for confirmation before running it.
    #[arg(short = 'i', long)]
    interactive: bool,

    /// Worker threads (connections) per database side.
    #[arg(short = 'j', long, value_name = "N")]
    threads: Option<usize>,
    /// Override worker threads for the left side.
    #[arg(long, value_name = "N")]
    threads1: Option<usize>,
    /// Override worker threads for the right side.
    #[arg(long, value_name = "N")]
    threads2: Option<usize>,

    /// Config file with [database.*] and [run.*] sections.
    #[arg(long, value_name = "FILE")]
    conf: Option<PathBuf>,
    /// Named [run.*] section to load.
    #[arg(long, value_name = "NAME")]
    run: Option<String>,

    /// Disable run tracking.
    #[arg(long)]
    no_tracking: bool,
    /// Exact-case column name resolution.
    #[arg(long)]
    case_sensitive: bool,
    /// Abort the whole run on the first segment failure.
    #[arg(long)]
    strict_errors: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    let code = match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {e}", e.kind());
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Fully resolved invocation: CLI flags layered over the config run.
struct Invocation {
    left_uri: String,
    left_table: String,
    right_uri: String,
    right_table: String,
    left: TableSegment,
    right: TableSegment,
    options: DiffOptions,
    threads_left: usize,
    threads_right: usize,
    stats: bool,
    json: bool,
}

fn resolve(mut cli: Cli) -> Result<Invocation, DiffError> {
    let config = match &cli.conf {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    if cli.run.is_some() && cli.conf.is_none() {
        return Err(DiffError::InvalidArgument(
            "--run requires --conf".into(),
        ));
    }
    let run = match &cli.run {
        Some(name) => config.resolve_run(name)?,
        None => Default::default(),
    };

    // CLI positionals beat config sides.
    let (left_ref, left_table) = side_reference(
        cli.db1.take(),
        cli.table1.take(),
        run.left.as_ref(),
        "left",
    )?;
    let (right_ref, right_table) = side_reference(
        cli.db2.take(),
        cli.table2.take(),
        run.right.as_ref(),
        "right",
    )?;
    let left_uri = config.database_uri(&left_ref)?;
    let right_uri = config.database_uri(&right_ref)?;

    let key_columns = if !cli.key_columns.is_empty() {
        cli.key_columns.clone()
    } else {
        run.key_columns.clone().unwrap_or_else(|| vec!["id".into()])
    };
    let update_column = cli.update_column.clone().or(run.update_column.clone());
    let columns = if !cli.columns.is_empty() {
        cli.columns.clone()
    } else {
        run.columns.clone().unwrap_or_default()
    };
    let where_predicate = cli.where_predicate.clone().or(run.where_predicate.clone());

    let now = chrono::Utc::now();
    // min-age excludes rows updated after (now - age); max-age excludes
    // rows updated before it.
    let max_update = cli
        .min_age
        .as_deref()
        .or(run.min_age.as_deref())
        .map(|age| age_to_instant(age, now))
        .transpose()?;
    let min_update = cli
        .max_age
        .as_deref()
        .or(run.max_age.as_deref())
        .map(|age| age_to_instant(age, now))
        .transpose()?;

    let algorithm = match cli.algorithm.as_deref().or(run.algorithm.as_deref()) {
        Some(text) => text.parse::<Algorithm>()?,
        None => Algorithm::Auto,
    };

    let threads = cli.threads.or(run.threads).unwrap_or(1);
    let threads_left = cli.threads1.unwrap_or(threads);
    let threads_right = cli.threads2.unwrap_or(threads);

    let materialize = cli
        .materialize
        .as_deref()
        .map(|name| {
            let expanded =
                name.replace("%t", &now.format("%Y%m%d_%H%M%S").to_string());
            TablePath::parse(&expanded)
        })
        .transpose()?;

    let build_segment = |table: &str| -> Result<TableSegment, DiffError> {
        let mut segment = TableSegment::new(TablePath::parse(table)?)
            .with_key_columns(key_columns.clone())
            .with_extra_columns(columns.clone())
            .with_update_bounds(min_update, max_update)
            .with_case_sensitive(cli.case_sensitive);
        if let Some(update) = &update_column {
            segment = segment.with_update_column(update.clone());
        }
        if let Some(predicate) = &where_predicate {
            segment = segment.with_where(predicate);
        }
        Ok(segment)
    };

    let options = DiffOptions {
        algorithm,
        bisection_factor: cli
            .bisection_factor
            .or(run.bisection_factor)
            .unwrap_or(32),
        bisection_threshold: cli
            .bisection_threshold
            .or(run.bisection_threshold)
            .unwrap_or(16_384),
        threads_left,
        threads_right,
        limit: cli.limit.or(run.limit),
        strict_errors: cli.strict_errors,
        assume_unique_key: cli.assume_unique_key,
        sample_exclusive_rows: cli.sample_exclusive_rows,
        materialize,
        materialize_all_rows: cli.materialize_all_rows,
        table_write_limit: cli.table_write_limit.unwrap_or(1_000),
        ..DiffOptions::default()
    };

    Ok(Invocation {
        left_uri,
        left_table: left_table.clone(),
        right_uri,
        right_table: right_table.clone(),
        left: build_segment(&left_table)?,
        right: build_segment(&right_table)?,
        options,
        threads_left,
        threads_right,
        stats: cli.stats || run.stats.unwrap_or(false),
        json: cli.json || run.json.unwrap_or(false),
    })
}

fn side_reference(
    db: Option<String>,
    table: Option<String>,
    configured: Option<&tablediff::config::RunSide>,
    which: &str,
) -> Result<(String, String), DiffError> {
    let db = db.or_else(|| configured.and_then(|s| s.database.clone()));
    let table = table.or_else(|| configured.and_then(|s| s.table.clone()));
    match (db, table) {
        (Some(db), Some(table)) => Ok((db, table)),
        _ => Err(DiffError::InvalidArgument(format!(
            "missing {which} database/table (pass positionals or configure [run.*].{which})"
        ))),
    }
}

fn execute(cli: Cli) -> Result<i32, DiffError> {
    let interactive = cli.interactive;
    let no_tracking = cli.no_tracking;
    let invocation = resolve(cli)?;

    let mut left_db = db::connect(&invocation.left_uri, invocation.threads_left)?;
    let mut right_db = db::connect(&invocation.right_uri, invocation.threads_right)?;
    if interactive {
        left_db = Arc::new(Confirming(left_db));
        right_db = Arc::new(Confirming(right_db));
    }

    let tracker: Arc<dyn Tracker> = if no_tracking {
        Arc::new(NoopTracker)
    } else {
        Arc::new(LogTracker)
    };

    let stream = engine::diff_tables(
        left_db,
        right_db,
        &invocation.left,
        &invocation.right,
        invocation.options.clone(),
        tracker,
    )?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut diffs = 0u64;
    let mut stream = stream;
    for item in stream.by_ref() {
        let event = item?;
        diffs += 1;
        let line = if invocation.json {
            serde_json::to_string(&event)
                .map_err(|e| DiffError::FatalBackend(format!("serialize event: {e}")))?
        } else {
            event.to_line()
        };
        if writeln!(out, "{line}").is_err() {
            // Broken pipe: stop cleanly, the stream drop cancels the run.
            break;
        }
    }
    drop(out);

    let stats = stream.stats()?;
    if invocation.stats {
        print_stats(&stats, invocation.json, &invocation.left_table, &invocation.right_table);
    }

    Ok(exit_code(&stats, diffs))
}

fn exit_code(stats: &DiffStats, diffs: u64) -> i32 {
    match stats.status {
        // A run cut short by a satisfied limit counts as success with
        // diffs; the LimitReached status wins over any later failure.
        RunStatus::Complete | RunStatus::LimitReached => {
            if diffs > 0 { 1 } else { 0 }
        }
        RunStatus::Incomplete => {
            eprintln!("warning: run incomplete, results are partial");
            3
        }
    }
}

fn print_stats(stats: &DiffStats, json: bool, left_table: &str, right_table: &str) {
    if json {
        match serde_json::to_string(stats) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("failed to serialize stats: {e}"),
        }
        return;
    }
    println!("{} rows in {left_table}, {} rows in {right_table}", stats.rows_left, stats.rows_right);
    println!(
        "{} rows differ ({:.2}%): {} added, {} removed, {} updated",
        stats.total_diffs(),
        stats.percent_different(),
        stats.diff_plus,
        stats.diff_minus,
        stats.updated_rows,
    );
    println!(
        "{} segments checksummed, {} split, {} rows downloaded (~{} bytes)",
        stats.segments_checksummed,
        stats.segments_split,
        stats.rows_downloaded,
        stats.bytes_downloaded,
    );
    println!("elapsed: {:.2}s, status: {:?}", stats.elapsed_seconds, stats.status);
}

/// Interactive wrapper: prints each query and requires confirmation.
struct Confirming(Arc<dyn Database>);

impl Database for Confirming {
    fn name(&self) -> String {
        self.0.name()
    }

    fn dialect(&self) -> &dyn Dialect {
        self.0.dialect()
    }

    fn execute(&self, plan: &QueryPlan) -> Result<QueryOutput, DiffError> {
        for statement in render_plan(self.0.dialect(), plan)? {
            eprintln!("[{}] {}", plan.label(), statement);
        }
        eprint!("run? [y/N] ");
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err()
            || !answer.trim().eq_ignore_ascii_case("y")
        {
            return Err(DiffError::Cancelled);
        }
        self.0.execute(plan)
    }

    fn table_schema(&self, path: &TablePath) -> Result<TableSchema, DiffError> {
        self.0.table_schema(path)
    }

    fn connection_identity(&self) -> String {
        self.0.connection_identity()
    }

    fn cancel_inflight(&self) {
        self.0.cancel_inflight()
    }
}
