//! Error types for tablediff.
//!
//! All failures inside the engine are represented by [`DiffError`]. Errors
//! are propagated via `Result<T, DiffError>` throughout the codebase and
//! mapped to a process exit code at the CLI boundary.
//!
//! # Error Classification
//!
//! Errors are classified into categories that determine retry behavior and
//! exit codes:
//! - **Config** — bad URIs, unknown algorithms, conflicting flags. Exit 2.
//! - **Schema** — unknown columns, type mismatches, unsupported compared
//!   types. Detected before any row work starts. Exit 2.
//! - **Backend** — adapter-level failures. Transient ones are retried by
//!   the checksum executor; fatal ones cancel the owning subtree. Exit 3.
//! - **Internal** — cancellation and limit signals. Never surfaced as a
//!   failure to the user.
//!
//! # Retry Policy
//!
//! The [`RetryPolicy`] struct holds the fixed backoff schedule the checksum
//! executor applies to transient backend errors (100 ms, then 500 ms).

use std::fmt;
use std::time::Duration;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    // ── Config errors — user input, fail before any work ─────────────────
    /// A connection string or database name could not be resolved.
    #[error("invalid database: {0}")]
    InvalidDatabase(String),

    /// A CLI flag or config value is invalid or flags conflict.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The config file could not be read or parsed.
    #[error("config error: {0}")]
    ConfigFile(String),

    // ── Schema errors — fail before any checksum is issued ───────────────
    /// A declared key, update, or extra column is absent from the table.
    #[error("unknown column {column:?} in table {table}")]
    UnknownColumn { table: String, column: String },

    /// The two sides declare structurally incompatible column types.
    #[error("type mismatch on column {column:?}: {left} vs {right}")]
    TypeMismatch {
        column: String,
        left: String,
        right: String,
    },

    /// A compared column's type has no stable canonical text form.
    #[error("unsupported compared column type {type_repr} on column {column:?}")]
    UnsupportedComparedType { column: String, type_repr: String },

    /// The table was not found during schema introspection.
    #[error("table not found: {0}")]
    TableNotFound(String),

    // ── Precondition errors ──────────────────────────────────────────────
    /// The joindiff key-uniqueness preamble found duplicate keys.
    #[error("duplicate key values in table {table}: {total} rows, {distinct} distinct keys")]
    DuplicateKey {
        table: String,
        total: u64,
        distinct: u64,
    },

    // ── Backend errors ───────────────────────────────────────────────────
    /// A query failed in a way that is worth retrying (connection reset,
    /// timeout, serialization failure).
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// A query failed permanently; the owning segment subtree is cancelled.
    #[error("backend error: {0}")]
    FatalBackend(String),

    // ── Internal signals — never shown as failures ───────────────────────
    /// The run was cancelled (limit reached, stream dropped, or Ctrl-C).
    #[error("cancelled")]
    Cancelled,

    /// The diff limit was reached; the run winds down cleanly.
    #[error("diff limit reached")]
    LimitReached,
}

/// Classification of an error for exit codes and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffErrorKind {
    Config,
    Schema,
    Backend,
    Internal,
}

impl fmt::Display for DiffErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffErrorKind::Config => write!(f, "CONFIG"),
            DiffErrorKind::Schema => write!(f, "SCHEMA"),
            DiffErrorKind::Backend => write!(f, "BACKEND"),
            DiffErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl DiffError {
    /// Classify the error.
    pub fn kind(&self) -> DiffErrorKind {
        match self {
            DiffError::InvalidDatabase(_)
            | DiffError::InvalidArgument(_)
            | DiffError::ConfigFile(_) => DiffErrorKind::Config,

            DiffError::UnknownColumn { .. }
            | DiffError::TypeMismatch { .. }
            | DiffError::UnsupportedComparedType { .. }
            | DiffError::TableNotFound(_) => DiffErrorKind::Schema,

            DiffError::DuplicateKey { .. }
            | DiffError::TransientBackend(_)
            | DiffError::FatalBackend(_) => DiffErrorKind::Backend,

            DiffError::Cancelled | DiffError::LimitReached => DiffErrorKind::Internal,
        }
    }

    /// Whether the checksum executor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiffError::TransientBackend(_))
    }

    /// Whether this error is an internal control-flow signal rather than a
    /// user-visible failure.
    pub fn is_signal(&self) -> bool {
        matches!(self, DiffError::Cancelled | DiffError::LimitReached)
    }

    /// Process exit code for the CLI boundary.
    ///
    /// 2 for user errors (config and schema), 3 for backend failures.
    /// Internal signals do not reach the exit-code path.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            DiffErrorKind::Config | DiffErrorKind::Schema => 2,
            DiffErrorKind::Backend => 3,
            DiffErrorKind::Internal => 1,
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Fixed backoff schedule for transient backend errors.
///
/// The checksum executor retries a failed aggregate query once per entry in
/// `delays`; when the schedule is exhausted the error surfaces as
/// [`DiffError::FatalBackend`] and cancels the owning subtree.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before each retry attempt, in order.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![Duration::from_millis(100), Duration::from_millis(500)],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries. Used by tests and by plans where the
    /// caller handles failure itself (e.g. the joindiff preamble).
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    /// Delay before the given retry attempt (0-based), or `None` when the
    /// schedule is exhausted.
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    /// Total number of attempts including the initial one.
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }
}
