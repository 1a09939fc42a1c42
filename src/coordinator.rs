//! Top-level orchestrator: backend selection and fallback, cache-first
//! execution, batching, memory pressure governance, and ordered teardown.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::BatchScheduler;
use crate::cache::{is_cacheable, CacheStats, ExecuteOptions, QueryCache};
use crate::config::CoordinatorConfig;
use crate::engine::{ExecutionBackend, InProcessBackend, IsolatedBackend, Rows};
use crate::error::{ExecError, InitError, ShutdownError};
use crate::memory::{
    recommended_budget, MemoryGovernor, MemorySampler, MemoryStatus, PressureLevel, SystemSampler,
};

/// Which backend currently serves queries. `InProcessFallback` means the
/// isolated engine was requested but unavailable, so queries run in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    Uninitialized,
    IsolatedActive,
    InProcessActive,
    InProcessFallback,
    Destroyed,
}

/// Coarse lifecycle notifications delivered to registered observers.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    InitStarted,
    InitCompleted { mode: BackendMode },
    FallbackEngaged { reason: String },
    QueryCompleted { rows: usize, elapsed: Duration, cached: bool },
    ShutdownStarted,
    ShutdownCompleted,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

struct ActiveState {
    mode: BackendMode,
    backend: Option<Arc<dyn ExecutionBackend>>,
    scheduler: Option<Arc<BatchScheduler>>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

pub struct ConnectionCoordinator {
    config: CoordinatorConfig,
    cache: QueryCache,
    governor: MemoryGovernor,
    state: Mutex<ActiveState>,
    // Serializes initialize; the mode gate alone would let two concurrent
    // calls both build backends and leak the loser's worker.
    init_lock: tokio::sync::Mutex<()>,
    observers: Mutex<Vec<ProgressCallback>>,
}

impl ConnectionCoordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self, InitError> {
        Self::with_sampler(config, Arc::new(SystemSampler::new()))
    }

    /// Construct with an injected memory source. Embedders with their own
    /// accounting (and tests) use this; `new` reads system memory.
    pub fn with_sampler(
        config: CoordinatorConfig,
        sampler: Arc<dyn MemorySampler>,
    ) -> Result<Self, InitError> {
        config.validate()?;
        let cache = QueryCache::new(config.cache_max_size, config.cache_ttl(), config.enable_cache);
        Ok(Self {
            config,
            cache,
            governor: MemoryGovernor::new(sampler),
            state: Mutex::new(ActiveState {
                mode: BackendMode::Uninitialized,
                backend: None,
                scheduler: None,
                monitor: None,
            }),
            init_lock: tokio::sync::Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Bring up the execution backend. The isolated engine is attempted first
    /// when configured; if its construction or startup acknowledgement fails,
    /// the coordinator transparently falls back to the in-process engine and
    /// records the switch in its mode.
    pub async fn initialize(&self) -> Result<(), InitError> {
        let _init = self.init_lock.lock().await;
        {
            let state = self.lock_state();
            match state.mode {
                BackendMode::Uninitialized | BackendMode::Destroyed => {}
                _ => return Err(InitError::AlreadyInitialized),
            }
        }
        self.emit(ProgressEvent::InitStarted);

        let init_sql = self.config.init_sql.as_deref();
        let (backend, mode): (Arc<dyn ExecutionBackend>, BackendMode) =
            if self.config.use_isolated_backend {
                match IsolatedBackend::connect(&self.config).await {
                    Ok(backend) => (Arc::new(backend), BackendMode::IsolatedActive),
                    Err(err) => {
                        warn!(error = %err, "isolated engine unavailable, falling back in-process");
                        self.emit(ProgressEvent::FallbackEngaged {
                            reason: err.to_string(),
                        });
                        (
                            Arc::new(InProcessBackend::open(init_sql)?),
                            BackendMode::InProcessFallback,
                        )
                    }
                }
            } else {
                (
                    Arc::new(InProcessBackend::open(init_sql)?),
                    BackendMode::InProcessActive,
                )
            };

        // Initial resource budget; later adjustments come from the monitor.
        let status = self.governor.status();
        let budget = recommended_budget(&status, self.config.cache_max_size);
        if let Err(err) = backend.apply_memory_limit(budget.engine_memory_mb).await {
            warn!(error = %err, "could not apply initial engine memory limit");
        }
        self.cache.set_capacity(budget.cache_capacity);

        let scheduler = if self.config.enable_batching {
            Some(Arc::new(BatchScheduler::new(
                backend.clone(),
                self.config.batch_window(),
                self.config.max_batch_size,
            )))
        } else {
            None
        };

        let monitor = tokio::spawn(monitor_pressure(
            self.governor.clone(),
            self.cache.clone(),
            backend.clone(),
            self.config.memory_check_interval(),
            self.config.cache_max_size,
            status.level,
        ));

        {
            let mut state = self.lock_state();
            state.backend = Some(backend);
            state.scheduler = scheduler;
            state.monitor = Some(monitor);
            state.mode = mode;
        }
        info!(mode = ?mode, "coordinator ready");
        self.emit(ProgressEvent::InitCompleted { mode });
        Ok(())
    }

    /// Execute a statement. Admission is refused outright under critical
    /// memory pressure; otherwise the cache is consulted first and a miss is
    /// routed through the batch scheduler when batching is enabled.
    pub async fn execute(&self, sql: &str, options: &ExecuteOptions) -> Result<Rows, ExecError> {
        let (backend, scheduler) = {
            let state = self.lock_state();
            match state.mode {
                BackendMode::Uninitialized => return Err(ExecError::NotReady),
                BackendMode::Destroyed => return Err(ExecError::Shutdown),
                _ => {}
            }
            (
                state.backend.clone().ok_or(ExecError::NotReady)?,
                state.scheduler.clone(),
            )
        };

        let status = self.governor.status();
        if status.level == PressureLevel::Critical {
            warn!(
                usage_ratio = status.usage_ratio,
                "refusing query under critical memory pressure"
            );
            return Err(ExecError::MemoryPressure);
        }

        let cacheable = !options.bypass_cache && is_cacheable(sql);
        if cacheable {
            if let Some(rows) = self.cache.get(sql, options) {
                debug!(rows = rows.total_rows, "served from cache");
                self.emit(ProgressEvent::QueryCompleted {
                    rows: rows.total_rows,
                    elapsed: Duration::ZERO,
                    cached: true,
                });
                return Ok(rows);
            }
        }

        let effective_sql = apply_row_window(sql, options);
        let started = Instant::now();
        let rows = match &scheduler {
            Some(scheduler) => scheduler.submit(&effective_sql).await?,
            None => backend.query(&effective_sql).await?,
        };
        let elapsed = started.elapsed();

        if cacheable {
            self.cache.set(sql, options, rows.clone());
        }
        debug!(
            rows = rows.total_rows,
            elapsed_ms = elapsed.as_millis() as u64,
            "query executed"
        );
        self.emit(ProgressEvent::QueryCompleted {
            rows: rows.total_rows,
            elapsed,
            cached: false,
        });
        Ok(rows)
    }

    /// Tear down in strict order: stop the scheduler, close the backend
    /// (rejecting anything still pending), stop the memory monitor, then
    /// mark the coordinator destroyed. Every step runs even when an earlier
    /// one failed; failures are aggregated.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let (backend, scheduler, monitor) = {
            let mut state = self.lock_state();
            if state.mode == BackendMode::Destroyed {
                return Ok(());
            }
            // Flip the mode in the same scope that takes the handles so a
            // racing execute sees Destroyed, not an active mode with no
            // backend.
            state.mode = BackendMode::Destroyed;
            (
                state.backend.take(),
                state.scheduler.take(),
                state.monitor.take(),
            )
        };
        self.emit(ProgressEvent::ShutdownStarted);
        let mut failures = Vec::new();

        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        if let Some(backend) = backend {
            if let Err(err) = backend.close().await {
                warn!(error = %err, "backend close failed during shutdown");
                failures.push(format!("backend close: {err}"));
            }
        }
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        info!(failures = failures.len(), "coordinator shut down");
        self.emit(ProgressEvent::ShutdownCompleted);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }

    pub fn mode(&self) -> BackendMode {
        self.lock_state().mode
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn memory_status(&self) -> MemoryStatus {
        self.governor.status()
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache.set_enabled(enabled);
    }

    /// Drop cached results whose key mentions the given pattern. Loaders
    /// call this after mutating a table that cached queries read from.
    pub fn invalidate_cache(&self, pattern: &str) -> usize {
        self.cache.invalidate(pattern)
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .expect("observer list mutex poisoned")
            .push(Arc::new(callback));
    }

    fn emit(&self, event: ProgressEvent) {
        let observers: Vec<ProgressCallback> = self
            .observers
            .lock()
            .expect("observer list mutex poisoned")
            .clone();
        for callback in &observers {
            callback(&event);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ActiveState> {
        self.state.lock().expect("coordinator state mutex poisoned")
    }
}

/// Rewrite a statement with the requested row window. The statement becomes
/// a subquery so a trailing line comment or an existing LIMIT clause cannot
/// swallow the window; the newline closes any trailing comment.
fn apply_row_window(sql: &str, options: &ExecuteOptions) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    if options.limit.is_none() && options.offset.is_none() {
        return trimmed.to_string();
    }
    let mut out = format!("SELECT * FROM ({trimmed}\n)");
    if let Some(limit) = options.limit {
        out.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = options.offset {
        out.push_str(&format!(" OFFSET {offset}"));
    }
    out
}

/// Background pressure watcher. On a level change it resizes the cache and
/// renegotiates the engine's memory limit from the current budget.
async fn monitor_pressure(
    governor: MemoryGovernor,
    cache: QueryCache,
    backend: Arc<dyn ExecutionBackend>,
    check_interval: Duration,
    base_cache_capacity: usize,
    initial_level: PressureLevel,
) {
    let mut tick = tokio::time::interval(check_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately and initialization already
    // applied a budget, so swallow it.
    tick.tick().await;

    let mut last_level = initial_level;
    loop {
        tick.tick().await;
        let status = governor.status();
        if status.level == last_level {
            continue;
        }
        info!(
            level = ?status.level,
            usage_ratio = status.usage_ratio,
            "memory pressure level changed"
        );
        let budget = recommended_budget(&status, base_cache_capacity);
        cache.set_capacity(budget.cache_capacity);
        if let Err(err) = backend.apply_memory_limit(budget.engine_memory_mb).await {
            warn!(error = %err, "could not adjust engine memory limit");
        }
        last_level = status.level;
    }
}
