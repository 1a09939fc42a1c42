//! Execution backends: the engine either runs in the caller's process or on
//! a dedicated worker thread reached by message passing.

use std::sync::Arc;

use async_trait::async_trait;
use duckdb::arrow::datatypes::{Schema, SchemaRef};
use duckdb::arrow::record_batch::RecordBatch;

use crate::error::ExecError;

pub mod in_process;
pub mod isolated;

pub use in_process::InProcessBackend;
pub use isolated::IsolatedBackend;

/// Result of a query execution. Arrow buffers are Arc-backed, so cloning a
/// result (for the cache) is cheap.
#[derive(Debug, Clone)]
pub struct Rows {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub total_rows: usize,
    pub total_bytes: usize,
}

impl Rows {
    /// Effect-only acknowledgement carrying no data.
    pub fn empty() -> Self {
        Self {
            schema: Arc::new(Schema::empty()),
            batches: Vec::new(),
            total_rows: 0,
            total_bytes: 0,
        }
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute a single SQL statement and return its rows (empty for
    /// effect-only statements).
    async fn query(&self, sql: &str) -> Result<Rows, ExecError>;

    /// Execute several statements as one logical call. Results come back in
    /// statement order; any failure fails the whole batch.
    async fn query_batch(&self, statements: &[String]) -> Result<Vec<Rows>, ExecError> {
        let mut results = Vec::with_capacity(statements.len());
        for sql in statements {
            results.push(self.query(sql).await?);
        }
        Ok(results)
    }

    /// Reconfigure the engine's memory budget, in megabytes.
    async fn apply_memory_limit(&self, limit_mb: u64) -> Result<(), ExecError>;

    async fn close(&self) -> Result<(), ExecError>;
}
