//! Database adapters.
//!
//! The engine sees a database as a [`Database`]: a dialect, typed-plan
//! execution, schema introspection, and best-effort cancellation. Two
//! implementations ship: [`postgres::PostgresAdapter`] over a real server
//! and [`memory::MemoryAdapter`], an in-process store the test suite runs
//! the whole engine against.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use crate::dialect::Dialect;
use crate::error::DiffError;
use crate::plan::{QueryOutput, QueryPlan};
use crate::table::{TablePath, TableSchema};

/// Capability set the engine requires of each adapter.
pub trait Database: Send + Sync {
    /// Display name with credentials redacted.
    fn name(&self) -> String;

    fn dialect(&self) -> &dyn Dialect;

    /// Execute one typed plan. Blocking; called from pool worker threads.
    fn execute(&self, plan: &QueryPlan) -> Result<QueryOutput, DiffError>;

    /// Resolve a table's columns to name/type pairs, in table order.
    fn table_schema(&self, path: &TablePath) -> Result<TableSchema, DiffError>;

    /// Identity token; two handles with equal identity address the same
    /// store with the same credentials (joindiff eligibility).
    fn connection_identity(&self) -> String;

    /// Ask the server to cancel in-flight queries. Best-effort.
    fn cancel_inflight(&self) {}
}

impl std::fmt::Debug for dyn Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Open an adapter from a connection string.
///
/// `postgres://` / `postgresql://` URIs connect a PostgreSQL adapter with
/// `connections` pooled clients; `memory://<namespace>` opens a handle on
/// a process-local store.
pub fn connect(uri: &str, connections: usize) -> Result<Arc<dyn Database>, DiffError> {
    if uri.starts_with("postgres://") || uri.starts_with("postgresql://") {
        Ok(Arc::new(postgres::PostgresAdapter::connect(
            uri,
            connections.max(1),
        )?))
    } else if let Some(namespace) = uri.strip_prefix("memory://") {
        Ok(Arc::new(memory::MemoryAdapter::open(namespace)))
    } else {
        Err(DiffError::InvalidDatabase(format!(
            "unsupported connection string {uri:?} (expected postgresql:// or memory://)"
        )))
    }
}
