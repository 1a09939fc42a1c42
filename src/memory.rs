//! Memory pressure sampling, classification, and budget derivation.
//!
//! The governor samples on demand and never persists a status across calls.
//! Budget derivation is a pure function so it is independently testable; the
//! coordinator and the cache apply its output.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use sysinfo::System;

pub const WARNING_RATIO: f64 = 0.75;
pub const CRITICAL_RATIO: f64 = 0.9;

// Engine gets a quarter of the currently-available memory, clamped; working
// space is a quarter of the engine budget.
const ENGINE_FRACTION: u64 = 4;
const WORKING_FRACTION: u64 = 4;
const ENGINE_FLOOR_MB: u64 = 128;
const ENGINE_CEILING_MB: u64 = 1024;

/// Raw numbers from a memory source.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub limit_bytes: u64,
}

/// Source of memory usage numbers. Embedders with their own accounting (or
/// tests) can supply an implementation; the default reads system memory.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Samples system memory via sysinfo. The process has no hard cap of its
/// own, so the limit equals total system memory.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemSampler {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock().expect("sampler mutex poisoned");
        system.refresh_memory();
        let total = system.total_memory();
        let available = system.available_memory();
        MemorySample {
            used_bytes: total.saturating_sub(available),
            total_bytes: total,
            limit_bytes: total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryStatus {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub limit_bytes: u64,
    pub usage_ratio: f64,
    pub level: PressureLevel,
}

/// Resource targets derived from a memory status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub engine_memory_mb: u64,
    pub working_memory_mb: u64,
    pub cache_capacity: usize,
}

#[derive(Clone)]
pub struct MemoryGovernor {
    sampler: Arc<dyn MemorySampler>,
}

impl MemoryGovernor {
    pub fn new(sampler: Arc<dyn MemorySampler>) -> Self {
        Self { sampler }
    }

    /// Sample current usage and classify it. Recomputed on every call.
    pub fn status(&self) -> MemoryStatus {
        let sample = self.sampler.sample();
        let usage_ratio = if sample.limit_bytes == 0 {
            0.0
        } else {
            sample.used_bytes as f64 / sample.limit_bytes as f64
        };
        MemoryStatus {
            used_bytes: sample.used_bytes,
            total_bytes: sample.total_bytes,
            limit_bytes: sample.limit_bytes,
            usage_ratio,
            level: classify(usage_ratio),
        }
    }
}

pub fn classify(usage_ratio: f64) -> PressureLevel {
    if usage_ratio >= CRITICAL_RATIO {
        PressureLevel::Critical
    } else if usage_ratio >= WARNING_RATIO {
        PressureLevel::Warning
    } else {
        PressureLevel::Normal
    }
}

/// Derive the engine memory allocation and the cache's target size from a
/// status. Pure: same status in, same budget out.
pub fn recommended_budget(status: &MemoryStatus, base_cache_capacity: usize) -> MemoryBudget {
    let available_mb = status.limit_bytes.saturating_sub(status.used_bytes) / (1024 * 1024);
    let engine_memory_mb = (available_mb / ENGINE_FRACTION).clamp(ENGINE_FLOOR_MB, ENGINE_CEILING_MB);
    let working_memory_mb = engine_memory_mb / WORKING_FRACTION;
    let cache_capacity = match status.level {
        PressureLevel::Normal => base_cache_capacity,
        PressureLevel::Warning => base_cache_capacity / 2,
        PressureLevel::Critical => 0,
    };
    MemoryBudget {
        engine_memory_mb,
        working_memory_mb,
        cache_capacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn status_at(usage_ratio: f64) -> MemoryStatus {
        let limit = 16 * GIB;
        let used = (limit as f64 * usage_ratio) as u64;
        MemoryStatus {
            used_bytes: used,
            total_bytes: limit,
            limit_bytes: limit,
            usage_ratio,
            level: classify(usage_ratio),
        }
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(classify(0.0), PressureLevel::Normal);
        assert_eq!(classify(0.74), PressureLevel::Normal);
        assert_eq!(classify(0.75), PressureLevel::Warning);
        assert_eq!(classify(0.89), PressureLevel::Warning);
        assert_eq!(classify(0.9), PressureLevel::Critical);
        assert_eq!(classify(1.2), PressureLevel::Critical);
    }

    #[test]
    fn budget_is_monotonic_in_usage_ratio() {
        let mut previous = u64::MAX;
        for step in 0..=20 {
            let status = status_at(step as f64 / 20.0);
            let budget = recommended_budget(&status, 100);
            assert!(
                budget.engine_memory_mb <= previous,
                "budget grew as usage rose at step {step}"
            );
            previous = budget.engine_memory_mb;
        }
    }

    #[test]
    fn budget_respects_floor_and_ceiling() {
        // Nearly exhausted memory still yields the floor.
        let starved = recommended_budget(&status_at(0.999), 100);
        assert_eq!(starved.engine_memory_mb, 128);

        // An idle machine is clamped to the ceiling.
        let idle = recommended_budget(&status_at(0.0), 100);
        assert_eq!(idle.engine_memory_mb, 1024);
        assert_eq!(idle.working_memory_mb, 256);
    }

    #[test]
    fn cache_capacity_tracks_pressure_level() {
        assert_eq!(recommended_budget(&status_at(0.5), 100).cache_capacity, 100);
        assert_eq!(recommended_budget(&status_at(0.8), 100).cache_capacity, 50);
        assert_eq!(recommended_budget(&status_at(0.95), 100).cache_capacity, 0);
    }

    #[test]
    fn status_handles_zero_limit() {
        struct ZeroSampler;
        impl MemorySampler for ZeroSampler {
            fn sample(&self) -> MemorySample {
                MemorySample {
                    used_bytes: 0,
                    total_bytes: 0,
                    limit_bytes: 0,
                }
            }
        }
        let governor = MemoryGovernor::new(Arc::new(ZeroSampler));
        let status = governor.status();
        assert_eq!(status.usage_ratio, 0.0);
        assert_eq!(status.level, PressureLevel::Normal);
    }

    #[test]
    fn system_sampler_reports_plausible_numbers() {
        let sample = SystemSampler::new().sample();
        assert!(sample.total_bytes > 0);
        assert!(sample.used_bytes <= sample.total_bytes);
        assert_eq!(sample.limit_bytes, sample.total_bytes);
    }
}
