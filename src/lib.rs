//! Client-side execution and caching coordinator for embedded DuckDB.
//!
//! The [`ConnectionCoordinator`] sits between application code and the
//! engine: it picks an execution backend (in-process or a dedicated worker
//! thread), correlates requests across the worker boundary with deadlines,
//! caches query results with TTL and least-recently-used eviction, batches
//! near-simultaneous queries into one round trip, and adapts the cache and
//! the engine's memory budget to observed memory pressure.

pub mod batch;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod correlate;
pub mod engine;
pub mod error;
pub mod memory;

pub use cache::{CacheStats, ExecuteOptions, QueryCache};
pub use config::CoordinatorConfig;
pub use coordinator::{BackendMode, ConnectionCoordinator, ProgressEvent};
pub use engine::{ExecutionBackend, InProcessBackend, IsolatedBackend, Rows};
pub use error::{ExecError, InitError, ShutdownError};
pub use memory::{MemoryStatus, PressureLevel};
