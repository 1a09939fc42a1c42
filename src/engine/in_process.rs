//! DuckDB running in the caller's own process.
//!
//! duckdb::Connection contains RefCell internally and is not Sync, so it
//! lives behind a Mutex and blocking engine work runs on the tokio blocking
//! pool.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::{Config, Connection};
use tracing::{debug, info};

use crate::engine::{ExecutionBackend, Rows};
use crate::error::{ExecError, InitError};

pub struct InProcessBackend {
    conn: Arc<Mutex<Connection>>,
}

impl InProcessBackend {
    /// Open an in-memory engine and run optional initialization SQL
    /// (extensions, ATTACH statements, freshly created tables).
    pub fn open(init_sql: Option<&str>) -> Result<Self, InitError> {
        let conn = open_engine(init_sql)?;
        info!("in-process engine ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<R, F>(&self, task: F) -> Result<R, ExecError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, ExecError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("connection mutex poisoned");
            task(&conn)
        })
        .await
        .map_err(|err| ExecError::Engine(format!("engine task failed: {err}")))?
    }
}

#[async_trait]
impl ExecutionBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn query(&self, sql: &str) -> Result<Rows, ExecError> {
        let sql = sql.to_string();
        self.run_blocking(move |conn| run_query(conn, &sql)).await
    }

    async fn apply_memory_limit(&self, limit_mb: u64) -> Result<(), ExecError> {
        self.run_blocking(move |conn| set_memory_limit(conn, limit_mb))
            .await
    }

    async fn close(&self) -> Result<(), ExecError> {
        // The connection is released when the backend is dropped; nothing to
        // flush for an in-memory engine.
        debug!("in-process engine closed");
        Ok(())
    }
}

/// Open an initialized engine connection. Shared with the isolated worker so
/// both backends run the same startup SQL.
pub(crate) fn open_engine(init_sql: Option<&str>) -> Result<Connection, InitError> {
    let conn = Connection::open_in_memory_with_flags(
        Config::default().enable_autoload_extension(true)?,
    )?;
    if let Some(sql) = init_sql {
        let trimmed = sql.trim();
        if !trimmed.is_empty() {
            info!("running engine init SQL");
            conn.execute_batch(trimmed)?;
        }
    }
    Ok(conn)
}

/// Execute one statement and collect its arrow batches with row and byte
/// accounting. Effect-only statements produce an empty result.
pub(crate) fn run_query(conn: &Connection, sql: &str) -> Result<Rows, ExecError> {
    if sql.contains('\0') {
        return Err(ExecError::Engine("SQL contains null bytes".to_string()));
    }
    let mut stmt = conn.prepare(sql).map_err(engine_err)?;
    let arrow = stmt.query_arrow([]).map_err(engine_err)?;
    let schema = arrow.get_schema();

    let mut total_rows = 0usize;
    let mut total_bytes = 0usize;
    let batches: Vec<RecordBatch> = arrow
        .inspect(|batch| {
            total_rows += batch.num_rows();
            total_bytes += batch.get_array_memory_size();
        })
        .collect();

    debug!(
        batch_count = batches.len(),
        total_rows, total_bytes, "executed query"
    );
    Ok(Rows {
        schema,
        batches,
        total_rows,
        total_bytes,
    })
}

pub(crate) fn set_memory_limit(conn: &Connection, limit_mb: u64) -> Result<(), ExecError> {
    conn.execute_batch(&format!("SET memory_limit='{limit_mb}MB';"))
        .map_err(engine_err)?;
    debug!(limit_mb, "applied engine memory limit");
    Ok(())
}

fn engine_err(err: duckdb::Error) -> ExecError {
    ExecError::Engine(err.to_string())
}
