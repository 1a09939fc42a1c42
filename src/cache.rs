//! Query result cache with TTL expiry and least-recently-used eviction.
//!
//! Keys normalize the SQL (case-fold and collapse whitespace outside quoted
//! literals) and append the semantically relevant options, so equivalent
//! spellings share an entry while different literals never collide. Counters
//! are owned by the instance so multiple coordinators stay independently
//! testable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::engine::Rows;

/// Per-call execution options. `limit`/`offset` are part of the cache key;
/// `ttl` and `bypass_cache` only steer caching behavior.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOptions {
    pub ttl: Option<Duration>,
    pub bypass_cache: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
    pub enabled: bool,
}

struct CacheEntry {
    value: Rows,
    created_at: Instant,
    ttl: Duration,
    last_accessed: u64,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    enabled: bool,
    access_clock: u64,
}

struct CacheShared {
    default_ttl: Duration,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheShared>,
}

impl QueryCache {
    pub fn new(capacity: usize, default_ttl: Duration, enabled: bool) -> Self {
        Self {
            inner: Arc::new(CacheShared {
                default_ttl,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    capacity,
                    enabled,
                    access_clock: 0,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Look up a result. Expired entries are dropped opportunistically on
    /// every call, so a stale entry is never returned even before an
    /// explicit `cleanup`.
    pub fn get(&self, sql: &str, options: &ExecuteOptions) -> Option<Rows> {
        let key = cache_key(sql, options);
        let mut state = self.lock_state();
        if !state.enabled {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Self::drop_expired(&mut state);

        state.access_clock += 1;
        let tick = state.access_clock;
        match state.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_accessed = tick;
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result. A disabled or zero-capacity cache makes this a no-op;
    /// inserting over capacity evicts the least-recently-accessed entry.
    pub fn set(&self, sql: &str, options: &ExecuteOptions, rows: Rows) {
        let key = cache_key(sql, options);
        let ttl = options.ttl.unwrap_or(self.inner.default_ttl);
        let mut state = self.lock_state();
        if !state.enabled || state.capacity == 0 {
            return;
        }
        Self::drop_expired(&mut state);

        state.access_clock += 1;
        let tick = state.access_clock;
        state.entries.insert(
            key,
            CacheEntry {
                value: rows,
                created_at: Instant::now(),
                ttl,
                last_accessed: tick,
            },
        );
        self.evict_over_capacity(&mut state);
    }

    /// Remove entries whose key contains the given pattern, matched
    /// case-insensitively so quoted literals (which keep their case in the
    /// key) are still reachable. Useful after a loader mutates a table that
    /// cached queries read from.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let needle = pattern.to_lowercase();
        let mut state = self.lock_state();
        let before = state.entries.len();
        state
            .entries
            .retain(|key, _| !key.to_lowercase().contains(&needle));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, pattern, "invalidated cache entries");
        }
        removed
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let mut state = self.lock_state();
        Self::drop_expired(&mut state)
    }

    /// Shrink (or grow) the capacity; shrinking evicts least-recently-used
    /// entries down to the new bound immediately.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock_state();
        if state.capacity != capacity {
            debug!(capacity, "cache capacity changed");
        }
        state.capacity = capacity;
        self.evict_over_capacity(&mut state);
    }

    /// Disable or re-enable the cache. The structure is retained so
    /// re-enabling is cheap; while disabled every get misses and set is a
    /// no-op.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock_state();
        state.enabled = enabled;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock_state();
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            size: state.entries.len(),
            capacity: state.capacity,
            enabled: state.enabled,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.inner.state.lock().expect("cache mutex poisoned")
    }

    fn drop_expired(state: &mut CacheState) -> usize {
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.expired(now));
        before - state.entries.len()
    }

    fn evict_over_capacity(&self, state: &mut CacheState) {
        while state.entries.len() > state.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    state.entries.remove(&key);
                    self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "evicted least-recently-used cache entry");
                }
                None => break,
            }
        }
    }
}

/// Build the cache key for a query plus its semantically relevant options.
pub fn cache_key(sql: &str, options: &ExecuteOptions) -> String {
    let mut key = normalize_sql(sql);
    if let Some(limit) = options.limit {
        key.push_str("|limit=");
        key.push_str(&limit.to_string());
    }
    if let Some(offset) = options.offset {
        key.push_str("|offset=");
        key.push_str(&offset.to_string());
    }
    key
}

/// Whether a statement's result is worth caching at all. Effect statements
/// (DDL/DML) are executed every time.
pub(crate) fn is_cacheable(sql: &str) -> bool {
    let normalized = normalize_sql(sql);
    normalized.starts_with("select") || normalized.starts_with("with")
}

/// Case-fold and whitespace-collapse SQL outside single-quoted literals so
/// equivalent spellings share a key while literal values stay distinct.
fn normalize_sql(sql: &str) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let mut out = String::with_capacity(trimmed.len());
    let mut in_literal = false;
    let mut pending_space = false;
    for ch in trimmed.chars() {
        if in_literal {
            out.push(ch);
            if ch == '\'' {
                in_literal = false;
            }
            continue;
        }
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        if ch == '\'' {
            in_literal = true;
            out.push(ch);
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}
