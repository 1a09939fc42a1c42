//! Error taxonomy for the coordinator.
//!
//! Initialization failures are recoverable (the coordinator falls back to
//! the in-process engine on the first attempt); execution failures are typed
//! results surfaced to the caller; shutdown failures are aggregated so every
//! teardown step still runs.

use std::time::Duration;

use thiserror::Error;

/// Backend construction or handshake failure.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine error: {0}")]
    Engine(#[from] duckdb::Error),

    #[error("engine worker failed to start: {0}")]
    WorkerStart(String),

    #[error("engine worker did not acknowledge startup within {0:?}")]
    StartupTimeout(Duration),

    #[error("coordinator is already initialized")]
    AlreadyInitialized,
}

/// Query execution failure. Clone so a whole-batch error fans out to every
/// waiter; engine errors carry the engine's own text verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("query refused under critical memory pressure")]
    MemoryPressure,

    #[error("coordinator is shutting down")]
    Shutdown,

    #[error("coordinator is not initialized")]
    NotReady,
}

/// Aggregated teardown failures. Shutdown is best-effort: every step runs
/// even when an earlier one fails, and the failures are collected here.
#[derive(Debug, Error)]
#[error("shutdown completed with {} failure(s): {}", .failures.len(), .failures.join("; "))]
pub struct ShutdownError {
    pub failures: Vec<String>,
}
