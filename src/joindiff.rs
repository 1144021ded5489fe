//! JoinDiff orchestrator.
//!
//! When both sides address the same database, one FULL OUTER JOIN on the
//! key columns replaces the whole bisection tree. The join projects both
//! sides' canonical columns and a difference flag; every surviving row
//! streams into the result channel with the same `(sign, key, row)` shape
//! hashdiff produces.
//!
//! Preconditions and options:
//! - unless `assume_unique_key` is set, a preamble verifies key uniqueness
//!   on each side and fails with `DuplicateKey` otherwise;
//! - `sample_exclusive` caps rows that exist on only one side;
//! - a materialization target persists the join projection, capped at
//!   `table_write_limit` rows.

use std::sync::atomic::Ordering;

use crate::error::{DiffError, RetryPolicy};
use crate::plan::{JoinedRow, QueryOutput, QueryPlan, ScanSpec};
use crate::runtime::DbPool;
use crate::stream::{DiffEmitter, DiffEvent, Sign};
use crate::table::TablePath;

/// JoinDiff options, resolved by the engine.
#[derive(Debug, Clone, Default)]
pub struct JoinDiffConfig {
    /// Skip the uniqueness preamble; duplicate keys may then produce
    /// false positives.
    pub assume_unique_key: bool,
    /// Cap for rows existing on one side only.
    pub sample_exclusive: Option<u64>,
    /// Target table for persisted results.
    pub materialize: Option<TablePath>,
    /// Materialize matching rows too.
    pub materialize_all_rows: bool,
    /// Row cap for materialization writes.
    pub table_write_limit: u64,
}

pub struct JoinDiffer {
    pub left_pool: DbPool,
    pub right_pool: DbPool,
    pub left: ScanSpec,
    pub right: ScanSpec,
    pub config: JoinDiffConfig,
    pub emitter: DiffEmitter,
}

impl JoinDiffer {
    /// Shared stats counters, surviving the differ itself.
    pub fn stats_handle(&self) -> std::sync::Arc<crate::stream::StatsCell> {
        self.emitter.stats.clone()
    }

    /// Run the join diff to completion.
    pub fn run(&self) -> Result<(), DiffError> {
        if !self.config.assume_unique_key {
            self.verify_unique_keys()?;
        }

        // Kick the write off before streaming so a small `--limit` cannot
        // starve the persisted table.
        let materialize = self.config.materialize.as_ref().map(|target| {
            self.right_pool.submit(
                QueryPlan::Materialize {
                    left: self.left.clone(),
                    right: self.right.clone(),
                    target: target.clone(),
                    write_limit: self.config.table_write_limit,
                    all_rows: self.config.materialize_all_rows,
                },
                RetryPolicy::default(),
            )
        });

        let rows = self
            .left_pool
            .submit(
                QueryPlan::OuterJoinDiff {
                    left: self.left.clone(),
                    right: self.right.clone(),
                    sample_exclusive: self.config.sample_exclusive,
                },
                RetryPolicy::default(),
            )
            .wait()?;
        let rows = match rows {
            QueryOutput::JoinRows(rows) => rows,
            other => {
                return Err(DiffError::FatalBackend(format!(
                    "unexpected joindiff result {other:?}"
                )));
            }
        };

        let stats = &self.emitter.stats;
        stats
            .rows_downloaded
            .fetch_add(rows.len() as u64, Ordering::Relaxed);

        let emit_result = self.emit_rows(rows);

        if let Some(pending) = materialize {
            match pending.wait() {
                Ok(QueryOutput::Written(n)) => {
                    tracing::info!(rows = n, "materialized diff results");
                }
                Ok(_) => {}
                // The write was cancelled with the rest of the run; the
                // limit signal is not a failure.
                Err(e) if e.is_signal() => {}
                Err(e) => return Err(e),
            }
        }

        match emit_result {
            Err(e) if e.is_signal() => Ok(()),
            other => other,
        }
    }

    fn emit_rows(&self, rows: Vec<JoinedRow>) -> Result<(), DiffError> {
        let stats = &self.emitter.stats;
        for row in rows {
            match (row.left, row.right) {
                (Some(cells), None) => {
                    self.emitter.emit(DiffEvent {
                        sign: Sign::Minus,
                        key: row.key,
                        row: cells,
                    })?;
                }
                (None, Some(cells)) => {
                    self.emitter.emit(DiffEvent {
                        sign: Sign::Plus,
                        key: row.key,
                        row: cells,
                    })?;
                }
                (Some(left_cells), Some(right_cells)) => {
                    stats.updated_rows.fetch_add(1, Ordering::Relaxed);
                    self.emitter.emit(DiffEvent {
                        sign: Sign::Minus,
                        key: row.key.clone(),
                        row: left_cells,
                    })?;
                    self.emitter.emit(DiffEvent {
                        sign: Sign::Plus,
                        key: row.key,
                        row: right_cells,
                    })?;
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    /// `COUNT(*)` vs `COUNT(DISTINCT key)` on each side, left first.
    fn verify_unique_keys(&self) -> Result<(), DiffError> {
        let pending_left = self.left_pool.submit(
            QueryPlan::KeyUniqueness(self.left.clone()),
            RetryPolicy::default(),
        );
        let pending_right = self.right_pool.submit(
            QueryPlan::KeyUniqueness(self.right.clone()),
            RetryPolicy::default(),
        );
        check_unique(&self.left.path, pending_left.wait()?)?;
        check_unique(&self.right.path, pending_right.wait()?)?;
        Ok(())
    }
}

fn check_unique(path: &TablePath, output: QueryOutput) -> Result<(), DiffError> {
    match output {
        QueryOutput::Uniqueness { total, distinct } if total != distinct => {
            Err(DiffError::DuplicateKey {
                table: path.to_string(),
                total,
                distinct,
            })
        }
        QueryOutput::Uniqueness { .. } => Ok(()),
        other => Err(DiffError::FatalBackend(format!(
            "unexpected uniqueness result {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_unique_passes_on_match() {
        let path = TablePath::new(vec!["t"]);
        assert!(
            check_unique(
                &path,
                QueryOutput::Uniqueness {
                    total: 10,
                    distinct: 10
                }
            )
            .is_ok()
        );
    }

    #[test]
    fn test_check_unique_rejects_duplicates() {
        let path = TablePath::new(vec!["t"]);
        let err = check_unique(
            &path,
            QueryOutput::Uniqueness {
                total: 10,
                distinct: 9,
            },
        )
        .unwrap_err();
        match err {
            DiffError::DuplicateKey {
                total, distinct, ..
            } => {
                assert_eq!(total, 10);
                assert_eq!(distinct, 9);
            }
            other => panic!("expected DuplicateKey, got {other:?}"),
        }
    }
}
