//! Batching of near-simultaneous queries into one backend round trip.
//!
//! A window opens with the first unflushed submission and closes at
//! `max_batch_size` queries or when `window` elapses, whichever comes first.
//! Results come back to the waiters in submission order; a whole-batch
//! failure is fanned out to everyone.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::engine::{ExecutionBackend, Rows};
use crate::error::ExecError;

struct BatchItem {
    sql: String,
    sink: oneshot::Sender<Result<Rows, ExecError>>,
}

pub struct BatchScheduler {
    submissions: mpsc::UnboundedSender<BatchItem>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BatchScheduler {
    pub fn new(backend: Arc<dyn ExecutionBackend>, window: Duration, max_batch_size: usize) -> Self {
        let (submissions, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(batch_loop(
            backend,
            receiver,
            window,
            max_batch_size.max(1),
        ));
        Self {
            submissions,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a statement; resolves when its window flushes.
    pub async fn submit(&self, sql: &str) -> Result<Rows, ExecError> {
        let (sink, receiver) = oneshot::channel();
        let item = BatchItem {
            sql: sql.to_string(),
            sink,
        };
        if self.submissions.send(item).is_err() {
            return Err(ExecError::Shutdown);
        }
        match receiver.await {
            Ok(outcome) => outcome,
            // Worker stopped with our sink still parked.
            Err(_) => Err(ExecError::Shutdown),
        }
    }

    /// Stop the worker. Queued and in-flight submissions see a shutdown
    /// error; later submissions are rejected outright.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().expect("scheduler mutex poisoned").take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
            debug!("batch scheduler stopped");
        }
    }
}

async fn batch_loop(
    backend: Arc<dyn ExecutionBackend>,
    mut receiver: mpsc::UnboundedReceiver<BatchItem>,
    window: Duration,
    max_batch_size: usize,
) {
    while let Some(first) = receiver.recv().await {
        let mut items = vec![first];
        let deadline = Instant::now() + window;
        while items.len() < max_batch_size {
            tokio::select! {
                item = receiver.recv() => match item {
                    Some(item) => items.push(item),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        flush(backend.as_ref(), items).await;
    }
    debug!("batch submission channel closed");
}

async fn flush(backend: &dyn ExecutionBackend, items: Vec<BatchItem>) {
    let statements: Vec<String> = items.iter().map(|item| item.sql.clone()).collect();
    debug!(count = statements.len(), "flushing query batch");
    match backend.query_batch(&statements).await {
        Ok(results) if results.len() == items.len() => {
            for (item, rows) in items.into_iter().zip(results) {
                let _ = item.sink.send(Ok(rows));
            }
        }
        Ok(results) => {
            warn!(
                expected = items.len(),
                got = results.len(),
                "backend returned mismatched batch result count"
            );
            for item in items {
                let _ = item
                    .sink
                    .send(Err(ExecError::Engine("batch result count mismatch".to_string())));
            }
        }
        Err(err) => {
            for item in items {
                let _ = item.sink.send(Err(err.clone()));
            }
        }
    }
}
