//! tablediff — row-level diffing for large tables within or across SQL
//! databases.
//!
//! Two algorithms share one result surface:
//!
//! - **HashDiff** recursively bisects the key space, comparing
//!   `(row count, checksum)` aggregates per segment and descending only
//!   into segments that differ. Bytes over the wire stay proportional to
//!   the number of actual differences, which is what makes billion-row
//!   comparisons tractable.
//! - **JoinDiff** runs a single FULL OUTER JOIN when both tables live on
//!   the same connection.
//!
//! Cross-engine correctness rests on canonical text: every compared column
//! is rendered server-side to a deterministic textual form (see
//! [`dialect`]), so the engine never compares raw typed values between
//! sides.
//!
//! The library surface is [`engine::diff_tables`]; the `tablediff` binary
//! wraps it with the CLI, config file, and output formatting.

pub mod checksum;
pub mod config;
pub mod db;
pub mod dialect;
pub mod duration;
pub mod engine;
pub mod error;
pub mod hashdiff;
pub mod joindiff;
pub mod plan;
pub mod planner;
pub mod rowdiff;
pub mod runtime;
pub mod segment;
pub mod sqlgen;
pub mod stream;
pub mod table;
pub mod track;
pub mod types;

pub use engine::{Algorithm, DiffOptions, diff_tables};
pub use error::{DiffError, DiffErrorKind};
pub use segment::KeyBounds;
pub use stream::{DiffEvent, DiffStats, DiffStream, RunStatus, Sign};
pub use table::{TablePath, TableSegment};
