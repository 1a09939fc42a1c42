//! DuckDB on a dedicated worker thread, reached by message passing.
//!
//! The worker owns its own connection; the async side never touches engine
//! state directly. Requests carry an identifier minted by the
//! [`RequestCorrelator`] and replies are pumped back into it, so a crashed
//! worker can never strand an awaiter past its deadline.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::correlate::RequestCorrelator;
use crate::engine::in_process::{open_engine, run_query, set_memory_limit};
use crate::engine::{ExecutionBackend, Rows};
use crate::error::{ExecError, InitError};

const CLOSE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum WorkerCommand {
    Ping,
    Query(String),
    QueryBatch(Vec<String>),
    SetMemoryLimit(u64),
    Shutdown,
}

#[derive(Debug)]
enum WorkerReply {
    Pong,
    Rows(Rows),
    Batch(Vec<Rows>),
    Done,
}

struct RequestEnvelope {
    id: u64,
    command: WorkerCommand,
}

struct ReplyEnvelope {
    id: u64,
    outcome: Result<WorkerReply, ExecError>,
}

#[derive(Debug)]
pub struct IsolatedBackend {
    correlator: Arc<RequestCorrelator<WorkerReply>>,
    requests: std_mpsc::Sender<RequestEnvelope>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IsolatedBackend {
    /// Spawn the engine worker and wait for its startup acknowledgement.
    /// Construction failures and a missed startup deadline both surface as
    /// `InitError` so the coordinator can fall back to the in-process engine.
    pub async fn connect(config: &CoordinatorConfig) -> Result<Self, InitError> {
        let (request_tx, request_rx) = std_mpsc::channel::<RequestEnvelope>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<ReplyEnvelope>();
        let init_sql = config.init_sql.clone();

        let worker = thread::Builder::new()
            .name("mallard-engine".to_string())
            .spawn(move || worker_loop(request_rx, reply_tx, init_sql))
            .map_err(|err| InitError::WorkerStart(err.to_string()))?;

        let correlator = Arc::new(RequestCorrelator::new(config.request_timeout()));
        let pump = tokio::spawn(pump_replies(reply_rx, correlator.clone()));
        let sweeper = tokio::spawn(sweep_loop(correlator.clone(), config.sweep_interval()));

        let backend = Self {
            correlator,
            requests: request_tx,
            worker: Mutex::new(Some(worker)),
            pump: Mutex::new(Some(pump)),
            sweeper: Mutex::new(Some(sweeper)),
        };

        let startup_timeout = config.startup_timeout();
        match tokio::time::timeout(startup_timeout, backend.send(WorkerCommand::Ping)).await {
            Ok(Ok(WorkerReply::Pong)) => {
                info!("isolated engine acknowledged startup");
                Ok(backend)
            }
            Ok(Ok(other)) => {
                let _ = backend.close().await;
                Err(InitError::WorkerStart(format!(
                    "unexpected startup reply: {other:?}"
                )))
            }
            Ok(Err(err)) => {
                let _ = backend.close().await;
                Err(InitError::WorkerStart(err.to_string()))
            }
            Err(_) => {
                let _ = backend.close().await;
                Err(InitError::StartupTimeout(startup_timeout))
            }
        }
    }

    /// Correlated round trip: mint an id, park a sink, forward the command.
    /// Resolution comes from the reply pump, the deadline sweep, or
    /// `cancel_all`, whichever writes first.
    async fn send(&self, command: WorkerCommand) -> Result<WorkerReply, ExecError> {
        let (id, receiver) = self.correlator.register();
        if self.requests.send(RequestEnvelope { id, command }).is_err() {
            self.correlator.discard(id);
            return Err(ExecError::Shutdown);
        }
        match receiver.await {
            Ok(outcome) => outcome,
            // Sink dropped without settling only happens when the backend is
            // being torn down underneath us.
            Err(_) => Err(ExecError::Shutdown),
        }
    }
}

#[async_trait]
impl ExecutionBackend for IsolatedBackend {
    fn name(&self) -> &'static str {
        "isolated"
    }

    async fn query(&self, sql: &str) -> Result<Rows, ExecError> {
        match self.send(WorkerCommand::Query(sql.to_string())).await? {
            WorkerReply::Rows(rows) => Ok(rows),
            other => Err(ExecError::Engine(format!(
                "unexpected worker reply: {other:?}"
            ))),
        }
    }

    async fn query_batch(&self, statements: &[String]) -> Result<Vec<Rows>, ExecError> {
        match self
            .send(WorkerCommand::QueryBatch(statements.to_vec()))
            .await?
        {
            WorkerReply::Batch(results) => Ok(results),
            other => Err(ExecError::Engine(format!(
                "unexpected worker reply: {other:?}"
            ))),
        }
    }

    async fn apply_memory_limit(&self, limit_mb: u64) -> Result<(), ExecError> {
        match self.send(WorkerCommand::SetMemoryLimit(limit_mb)).await? {
            WorkerReply::Done => Ok(()),
            other => Err(ExecError::Engine(format!(
                "unexpected worker reply: {other:?}"
            ))),
        }
    }

    /// Teardown order: reject everything pending, ask the worker to stop,
    /// then join it. Every step runs even if a prior one failed.
    async fn close(&self) -> Result<(), ExecError> {
        let cancelled = self.correlator.cancel_all(ExecError::Shutdown);
        if cancelled > 0 {
            warn!(cancelled, "rejected pending engine requests during close");
        }

        match tokio::time::timeout(CLOSE_CONFIRM_TIMEOUT, self.send(WorkerCommand::Shutdown)).await
        {
            Ok(Ok(_)) => debug!("isolated engine confirmed shutdown"),
            Ok(Err(err)) => debug!(error = %err, "isolated engine already gone at shutdown"),
            Err(_) => warn!("isolated engine did not confirm shutdown in time"),
        }

        if let Some(pump) = self.pump.lock().expect("pump mutex poisoned").take() {
            pump.abort();
        }
        if let Some(sweeper) = self.sweeper.lock().expect("sweeper mutex poisoned").take() {
            sweeper.abort();
        }

        let worker = self.worker.lock().expect("worker mutex poisoned").take();
        if let Some(worker) = worker {
            let joined = tokio::task::spawn_blocking(move || worker.join()).await;
            match joined {
                Ok(Ok(())) => {}
                _ => {
                    return Err(ExecError::Engine(
                        "engine worker terminated abnormally".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// The worker thread: opens its own connection, then serves envelopes until
/// a shutdown command arrives or the coordinator side disappears.
fn worker_loop(
    requests: std_mpsc::Receiver<RequestEnvelope>,
    replies: mpsc::UnboundedSender<ReplyEnvelope>,
    init_sql: Option<String>,
) {
    let conn = match open_engine(init_sql.as_deref()) {
        Ok(conn) => conn,
        Err(err) => {
            warn!(error = %err, "isolated engine failed to start");
            // Answer everything with the construction error so the startup
            // handshake fails fast instead of waiting out its deadline.
            for envelope in requests.iter() {
                let is_shutdown = matches!(envelope.command, WorkerCommand::Shutdown);
                let _ = replies.send(ReplyEnvelope {
                    id: envelope.id,
                    outcome: Err(ExecError::Engine(err.to_string())),
                });
                if is_shutdown {
                    break;
                }
            }
            return;
        }
    };

    debug!("isolated engine worker started");
    for envelope in requests.iter() {
        let RequestEnvelope { id, command } = envelope;
        if matches!(command, WorkerCommand::Shutdown) {
            let _ = replies.send(ReplyEnvelope {
                id,
                outcome: Ok(WorkerReply::Done),
            });
            break;
        }
        let outcome = match command {
            WorkerCommand::Ping => Ok(WorkerReply::Pong),
            WorkerCommand::Query(sql) => run_query(&conn, &sql).map(WorkerReply::Rows),
            WorkerCommand::QueryBatch(statements) => run_batch(&conn, &statements),
            WorkerCommand::SetMemoryLimit(limit_mb) => {
                set_memory_limit(&conn, limit_mb).map(|_| WorkerReply::Done)
            }
            WorkerCommand::Shutdown => unreachable!("handled above"),
        };
        if replies.send(ReplyEnvelope { id, outcome }).is_err() {
            // Coordinator side is gone; nothing left to serve.
            break;
        }
    }
    debug!("isolated engine worker stopped");
}

fn run_batch(conn: &duckdb::Connection, statements: &[String]) -> Result<WorkerReply, ExecError> {
    let mut results = Vec::with_capacity(statements.len());
    for sql in statements {
        results.push(run_query(conn, sql)?);
    }
    Ok(WorkerReply::Batch(results))
}

async fn pump_replies(
    mut replies: mpsc::UnboundedReceiver<ReplyEnvelope>,
    correlator: Arc<RequestCorrelator<WorkerReply>>,
) {
    while let Some(reply) = replies.recv().await {
        if !correlator.resolve(reply.id, reply.outcome) {
            debug!(id = reply.id, "dropping reply for settled request");
        }
    }
    debug!("engine reply channel closed");
}

async fn sweep_loop(correlator: Arc<RequestCorrelator<WorkerReply>>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let swept = correlator.sweep();
        if swept > 0 {
            warn!(swept, "timed out pending engine requests");
        }
    }
}
