//! Pending-request table correlating isolated-engine replies with awaiters.
//!
//! Every request sent across the worker boundary gets a fresh identifier and
//! a write-once sink. An entry is settled exactly once: by an inbound reply,
//! by the deadline sweep, or by `cancel_all`. Late or duplicate replies find
//! no entry and are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ExecError;

#[derive(Debug)]
struct PendingRequest<T> {
    sink: oneshot::Sender<Result<T, ExecError>>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct RequestCorrelator<T> {
    pending: Mutex<HashMap<u64, PendingRequest<T>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl<T: Send> RequestCorrelator<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Mint a fresh identifier and park a write-once sink for it.
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<T, ExecError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, receiver) = oneshot::channel();
        let deadline = Instant::now() + self.timeout;
        self.pending
            .lock()
            .expect("pending table mutex poisoned")
            .insert(id, PendingRequest { sink, deadline });
        (id, receiver)
    }

    /// Settle a request with a reply or an error. Returns false when the
    /// identifier is unknown, already settled, or swept; the first writer
    /// wins and everything later is ignored.
    pub fn resolve(&self, id: u64, outcome: Result<T, ExecError>) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("pending table mutex poisoned")
            .remove(&id);
        match entry {
            Some(request) => {
                // The awaiter may have given up already; that is fine.
                let _ = request.sink.send(outcome);
                true
            }
            None => {
                debug!(id, "no pending request for inbound reply");
                false
            }
        }
    }

    /// Drop a registration without settling it (used when forwarding the
    /// request to the worker failed before it was ever in flight).
    pub fn discard(&self, id: u64) {
        self.pending
            .lock()
            .expect("pending table mutex poisoned")
            .remove(&id);
    }

    /// Reject every entry past its deadline with a timeout error. Driven on
    /// a fixed tick so no awaiter dangles even if the worker died silently.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u64, PendingRequest<T>)> = {
            let mut pending = self.pending.lock().expect("pending table mutex poisoned");
            let overdue: Vec<u64> = pending
                .iter()
                .filter(|(_, request)| request.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            overdue
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };
        let count = expired.len();
        for (id, request) in expired {
            debug!(id, "pending request passed its deadline");
            let _ = request.sink.send(Err(ExecError::Timeout(self.timeout)));
        }
        count
    }

    /// Reject every outstanding entry with the supplied reason (shutdown or
    /// backend replacement).
    pub fn cancel_all(&self, reason: ExecError) -> usize {
        let drained: Vec<PendingRequest<T>> = self
            .pending
            .lock()
            .expect("pending table mutex poisoned")
            .drain()
            .map(|(_, request)| request)
            .collect();
        let count = drained.len();
        for request in drained {
            let _ = request.sink.send(Err(reason.clone()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("pending table mutex poisoned")
            .len()
    }
}
