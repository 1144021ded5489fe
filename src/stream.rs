//! The diff result stream.
//!
//! Orchestrator tasks emit [`DiffEvent`]s through a shared [`DiffEmitter`]
//! into a bounded channel; the caller consumes them lazily through
//! [`DiffStream`]. A slow consumer applies backpressure to emitting
//! workers. Closing the stream before exhaustion cancels the run; reaching
//! the configured limit closes it from the producing side.

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::DiffError;
use crate::runtime::{CancelReason, CancelToken};
use crate::types::{Key, format_key};

/// Which side a row exists on. `Minus` is "left only", `Plus` is "right
/// only"; a modified row surfaces as a `-` followed by a `+` with the same
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Plus,
    Minus,
}

impl Serialize for Sign {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            Sign::Plus => "+",
            Sign::Minus => "-",
        })
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sign::Plus => write!(f, "+"),
            Sign::Minus => write!(f, "-"),
        }
    }
}

/// One row-level difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffEvent {
    pub sign: Sign,
    pub key: Key,
    /// Canonical text of the compared (non-key) columns on that side.
    pub row: Vec<Option<String>>,
}

impl DiffEvent {
    /// Human-readable line: `+ (42, completed)`.
    pub fn to_line(&self) -> String {
        let mut parts = vec![format_key(&self.key)];
        for cell in &self.row {
            parts.push(cell.clone().unwrap_or_else(|| "NULL".to_string()));
        }
        format!("{} ({})", self.sign, parts.join(", "))
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    /// Cut short by the diff limit; partial results are valid.
    LimitReached,
    /// Cut short by cancellation or a segment failure; partial results
    /// remain valid.
    Incomplete,
}

/// Summary statistics reported once the stream is exhausted.
#[derive(Debug, Clone, Serialize)]
pub struct DiffStats {
    pub rows_left: u64,
    pub rows_right: u64,
    pub diff_plus: u64,
    pub diff_minus: u64,
    /// Keys emitted as a paired `-`/`+` modification.
    pub updated_rows: u64,
    pub segments_checksummed: u64,
    pub segments_split: u64,
    pub rows_downloaded: u64,
    /// Rough bytes-over-the-wire estimate from canonical text lengths.
    pub bytes_downloaded: u64,
    pub elapsed_seconds: f64,
    pub status: RunStatus,
}

impl Default for DiffStats {
    fn default() -> Self {
        DiffStats {
            rows_left: 0,
            rows_right: 0,
            diff_plus: 0,
            diff_minus: 0,
            updated_rows: 0,
            segments_checksummed: 0,
            segments_split: 0,
            rows_downloaded: 0,
            bytes_downloaded: 0,
            elapsed_seconds: 0.0,
            status: RunStatus::Complete,
        }
    }
}

impl DiffStats {
    pub fn total_diffs(&self) -> u64 {
        self.diff_plus + self.diff_minus
    }

    /// Percentage of compared rows that differ, against the larger side.
    pub fn percent_different(&self) -> f64 {
        let denominator = self.rows_left.max(self.rows_right);
        if denominator == 0 {
            0.0
        } else {
            100.0 * self.total_diffs() as f64 / denominator as f64
        }
    }
}

// ── Emitter ────────────────────────────────────────────────────────────────

/// Shared producer handle. Thread-safe; every orchestrator task emits
/// through one of these.
pub struct DiffEmitter {
    tx: Sender<DiffEvent>,
    cancel: CancelToken,
    limit: Option<u64>,
    emitted: AtomicU64,
    pub stats: std::sync::Arc<StatsCell>,
}

impl DiffEmitter {
    pub fn new(tx: Sender<DiffEvent>, cancel: CancelToken, limit: Option<u64>) -> Self {
        DiffEmitter {
            tx,
            cancel,
            limit,
            emitted: AtomicU64::new(0),
            stats: std::sync::Arc::new(StatsCell::default()),
        }
    }

    /// Emit one event. Blocks under consumer backpressure. Fails with the
    /// cancellation signal once the run is cancelled or the limit is hit;
    /// the caller stops its segment.
    pub fn emit(&self, event: DiffEvent) -> Result<(), DiffError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancel.as_error());
        }
        if let Some(limit) = self.limit {
            // Reserve a slot; failing the reservation means the limit was
            // already consumed by other segments.
            let prior = self.emitted.fetch_add(1, Ordering::SeqCst);
            if prior >= limit {
                self.cancel.cancel(CancelReason::LimitReached);
                return Err(DiffError::LimitReached);
            }
            self.send(event)?;
            if prior + 1 == limit {
                self.cancel.cancel(CancelReason::LimitReached);
            }
            Ok(())
        } else {
            self.emitted.fetch_add(1, Ordering::SeqCst);
            self.send(event)
        }
    }

    fn send(&self, event: DiffEvent) -> Result<(), DiffError> {
        match event.sign {
            Sign::Plus => self.stats.diff_plus.fetch_add(1, Ordering::Relaxed),
            Sign::Minus => self.stats.diff_minus.fetch_add(1, Ordering::Relaxed),
        };
        if self.tx.send(event).is_err() {
            self.cancel.cancel(CancelReason::StreamClosed);
            return Err(DiffError::Cancelled);
        }
        Ok(())
    }
}

/// Lock-free counters the orchestrators bump as they work.
#[derive(Default)]
pub struct StatsCell {
    pub rows_left: AtomicU64,
    pub rows_right: AtomicU64,
    pub diff_plus: AtomicU64,
    pub diff_minus: AtomicU64,
    pub updated_rows: AtomicU64,
    pub segments_checksummed: AtomicU64,
    pub segments_split: AtomicU64,
    pub rows_downloaded: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

impl StatsCell {
    pub fn snapshot(&self, elapsed: Duration, status: RunStatus) -> DiffStats {
        DiffStats {
            rows_left: self.rows_left.load(Ordering::Relaxed),
            rows_right: self.rows_right.load(Ordering::Relaxed),
            diff_plus: self.diff_plus.load(Ordering::Relaxed),
            diff_minus: self.diff_minus.load(Ordering::Relaxed),
            updated_rows: self.updated_rows.load(Ordering::Relaxed),
            segments_checksummed: self.segments_checksummed.load(Ordering::Relaxed),
            segments_split: self.segments_split.load(Ordering::Relaxed),
            rows_downloaded: self.rows_downloaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            elapsed_seconds: elapsed.as_secs_f64(),
            status,
        }
    }
}

// ── Stream ─────────────────────────────────────────────────────────────────

/// Lazy sequence of diff events, ordered as discovered. Dropping the
/// stream before exhaustion cancels the run upstream.
pub struct DiffStream {
    rx: Receiver<DiffEvent>,
    cancel: CancelToken,
    orchestrator: Option<JoinHandle<Result<DiffStats, DiffError>>>,
    outcome: Option<Result<DiffStats, DiffError>>,
    error_yielded: bool,
}

impl fmt::Debug for DiffStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffStream")
            .field("outcome", &self.outcome)
            .field("error_yielded", &self.error_yielded)
            .finish()
    }
}

impl DiffStream {
    pub(crate) fn new(
        rx: Receiver<DiffEvent>,
        cancel: CancelToken,
        orchestrator: JoinHandle<Result<DiffStats, DiffError>>,
    ) -> Self {
        DiffStream {
            rx,
            cancel,
            orchestrator: Some(orchestrator),
            outcome: None,
            error_yielded: false,
        }
    }

    fn join_orchestrator(&mut self) {
        if let Some(handle) = self.orchestrator.take() {
            self.outcome = Some(match handle.join() {
                Ok(result) => result,
                Err(_) => Err(DiffError::FatalBackend(
                    "orchestrator thread panicked".to_string(),
                )),
            });
        }
    }

    /// Summary statistics. Consumes the remainder of the stream.
    pub fn stats(mut self) -> Result<DiffStats, DiffError> {
        for _ in self.by_ref() {}
        self.join_orchestrator();
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => Err(DiffError::Cancelled),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Iterator for DiffStream {
    type Item = Result<DiffEvent, DiffError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.recv() {
            Ok(event) => Some(Ok(event)),
            Err(_) => {
                // Producer side closed: surface a terminal error once.
                self.join_orchestrator();
                if self.error_yielded {
                    return None;
                }
                match &self.outcome {
                    Some(Err(e)) if !e.is_signal() => {
                        self.error_yielded = true;
                        Some(Err(clone_error(e)))
                    }
                    _ => None,
                }
            }
        }
    }
}

impl Drop for DiffStream {
    fn drop(&mut self) {
        if self.orchestrator.is_some() {
            self.cancel.cancel(CancelReason::StreamClosed);
        }
    }
}

fn clone_error(e: &DiffError) -> DiffError {
    match e {
        DiffError::FatalBackend(msg) => DiffError::FatalBackend(msg.clone()),
        DiffError::TransientBackend(msg) => DiffError::TransientBackend(msg.clone()),
        DiffError::DuplicateKey {
            table,
            total,
            distinct,
        } => DiffError::DuplicateKey {
            table: table.clone(),
            total: *total,
            distinct: *distinct,
        },
        other => DiffError::FatalBackend(other.to_string()),
    }
}
