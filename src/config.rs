use std::time::Duration;

use serde::Deserialize;

use crate::error::InitError;

/// Coordinator configuration with documented defaults.
///
/// Durations are plain integer fields so the struct deserializes from any
/// config source; accessor methods return [`Duration`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Run the engine on a dedicated worker thread instead of in the
    /// caller's process.
    pub use_isolated_backend: bool,
    /// Cache query results keyed by normalized SQL plus options.
    pub enable_cache: bool,
    /// Default time-to-live for cached results.
    pub cache_ttl_seconds: u64,
    /// Maximum number of cached entries; pressure may shrink this at runtime.
    pub cache_max_size: usize,
    /// Collect near-simultaneous queries into one backend round trip.
    pub enable_batching: bool,
    /// How long a batch window stays open after its first query.
    pub batch_window_ms: u64,
    /// Flush a batch early once this many queries have accumulated.
    pub max_batch_size: usize,
    /// Deadline for a single correlated request to the isolated engine.
    pub request_timeout_ms: u64,
    /// Deadline for the isolated engine to acknowledge startup before the
    /// coordinator falls back to the in-process engine.
    pub startup_timeout_ms: u64,
    /// Tick at which overdue pending requests are swept and rejected.
    pub sweep_interval_ms: u64,
    /// Tick at which memory pressure is re-sampled.
    pub memory_check_interval_ms: u64,
    /// Optional SQL executed once when the engine opens (extensions,
    /// ATTACH statements, freshly created tables).
    pub init_sql: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            use_isolated_backend: true,
            enable_cache: true,
            cache_ttl_seconds: 60,
            cache_max_size: 100,
            enable_batching: false,
            batch_window_ms: 25,
            max_batch_size: 10,
            request_timeout_ms: 5_000,
            startup_timeout_ms: 5_000,
            sweep_interval_ms: 250,
            memory_check_interval_ms: 10_000,
            init_sql: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.memory_check_interval_ms)
    }

    pub fn validate(&self) -> Result<(), InitError> {
        if self.enable_cache && self.cache_max_size == 0 {
            return Err(InitError::Config(
                "cache_max_size must be nonzero when caching is enabled".to_string(),
            ));
        }
        if self.enable_batching && self.max_batch_size == 0 {
            return Err(InitError::Config(
                "max_batch_size must be at least 1 when batching is enabled".to_string(),
            ));
        }
        if self.enable_batching && self.batch_window_ms == 0 {
            return Err(InitError::Config(
                "batch_window_ms must be nonzero when batching is enabled".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(InitError::Config(
                "request_timeout_ms must be nonzero".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(InitError::Config(
                "sweep_interval_ms must be nonzero".to_string(),
            ));
        }
        if self.memory_check_interval_ms == 0 {
            return Err(InitError::Config(
                "memory_check_interval_ms must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}
