//! End-to-end scenarios through the public surface against a real engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mallard::memory::{MemorySample, MemorySampler};
use mallard::{
    BackendMode, ConnectionCoordinator, CoordinatorConfig, ExecError, ExecuteOptions,
    PressureLevel, ProgressEvent,
};

struct FixedSampler {
    used: Mutex<u64>,
    total: u64,
}

impl FixedSampler {
    fn at(ratio: f64) -> Arc<Self> {
        let total: u64 = 16 * 1024 * 1024 * 1024;
        Arc::new(Self {
            used: Mutex::new((total as f64 * ratio) as u64),
            total,
        })
    }

    fn set_ratio(&self, ratio: f64) {
        *self.used.lock().unwrap() = (self.total as f64 * ratio) as u64;
    }
}

impl MemorySampler for FixedSampler {
    fn sample(&self) -> MemorySample {
        MemorySample {
            used_bytes: *self.used.lock().unwrap(),
            total_bytes: self.total,
            limit_bytes: self.total,
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn isolated_backend_serves_a_full_session() {
    init_tracing();
    let config = CoordinatorConfig {
        use_isolated_backend: true,
        init_sql: Some(
            "CREATE TABLE cities (name VARCHAR, population BIGINT); \
             INSERT INTO cities VALUES ('berlin', 3700000), ('paris', 2100000), ('rome', 2800000);"
                .to_string(),
        ),
        ..CoordinatorConfig::default()
    };
    let coordinator = ConnectionCoordinator::with_sampler(config, FixedSampler::at(0.3)).unwrap();
    coordinator.initialize().await.unwrap();
    assert_eq!(coordinator.mode(), BackendMode::IsolatedActive);

    let options = ExecuteOptions::default();
    let rows = coordinator
        .execute(
            "SELECT name FROM cities WHERE population > 2500000 ORDER BY name",
            &options,
        )
        .await
        .unwrap();
    assert_eq!(rows.total_rows, 2);
    assert_eq!(rows.schema.field(0).name(), "name");

    // Same query modulo case and whitespace lands on the cached entry.
    coordinator
        .execute(
            "select name from cities\nwhere population > 2500000 order by name",
            &options,
        )
        .await
        .unwrap();
    let stats = coordinator.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);

    coordinator.shutdown().await.unwrap();
    assert_eq!(coordinator.mode(), BackendMode::Destroyed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn isolated_queries_after_shutdown_are_rejected() {
    init_tracing();
    let coordinator =
        ConnectionCoordinator::with_sampler(CoordinatorConfig::default(), FixedSampler::at(0.3))
            .unwrap();
    coordinator.initialize().await.unwrap();
    coordinator.shutdown().await.unwrap();

    let err = coordinator
        .execute("SELECT 1", &ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ExecError::Shutdown);
}

#[tokio::test]
async fn startup_deadline_miss_degrades_to_in_process() {
    init_tracing();
    let config = CoordinatorConfig {
        use_isolated_backend: true,
        startup_timeout_ms: 0,
        ..CoordinatorConfig::default()
    };
    let coordinator = ConnectionCoordinator::with_sampler(config, FixedSampler::at(0.3)).unwrap();

    let fallbacks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = fallbacks.clone();
    coordinator.on_progress(move |event| {
        if let ProgressEvent::FallbackEngaged { reason } = event {
            sink.lock().unwrap().push(reason.clone());
        }
    });

    coordinator.initialize().await.unwrap();
    assert_eq!(coordinator.mode(), BackendMode::InProcessFallback);
    assert_eq!(fallbacks.lock().unwrap().len(), 1);

    let rows = coordinator
        .execute("SELECT 21 * 2 AS v", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(rows.total_rows, 1);
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pressure_spike_blocks_admission_until_it_clears() {
    init_tracing();
    let sampler = FixedSampler::at(0.3);
    let config = CoordinatorConfig {
        use_isolated_backend: false,
        ..CoordinatorConfig::default()
    };
    let coordinator = ConnectionCoordinator::with_sampler(config, sampler.clone()).unwrap();
    coordinator.initialize().await.unwrap();

    let options = ExecuteOptions::default();
    coordinator.execute("SELECT 1", &options).await.unwrap();
    assert_eq!(coordinator.memory_status().level, PressureLevel::Normal);

    sampler.set_ratio(0.95);
    assert_eq!(coordinator.memory_status().level, PressureLevel::Critical);
    assert_eq!(
        coordinator.execute("SELECT 1", &options).await.unwrap_err(),
        ExecError::MemoryPressure
    );

    sampler.set_ratio(0.3);
    coordinator.execute("SELECT 1", &options).await.unwrap();
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pressure_monitor_shrinks_the_cache_at_runtime() {
    init_tracing();
    let sampler = FixedSampler::at(0.3);
    let config = CoordinatorConfig {
        use_isolated_backend: false,
        cache_max_size: 8,
        memory_check_interval_ms: 25,
        ..CoordinatorConfig::default()
    };
    let coordinator = ConnectionCoordinator::with_sampler(config, sampler.clone()).unwrap();
    coordinator.initialize().await.unwrap();
    assert_eq!(coordinator.cache_stats().capacity, 8);

    sampler.set_ratio(0.8);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(coordinator.cache_stats().capacity, 4);

    sampler.set_ratio(0.3);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(coordinator.cache_stats().capacity, 8);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batched_session_returns_each_caller_its_own_rows() {
    init_tracing();
    let config = CoordinatorConfig {
        use_isolated_backend: true,
        enable_batching: true,
        batch_window_ms: 30,
        max_batch_size: 4,
        enable_cache: false,
        cache_max_size: 1,
        ..CoordinatorConfig::default()
    };
    let coordinator =
        Arc::new(ConnectionCoordinator::with_sampler(config, FixedSampler::at(0.3)).unwrap());
    coordinator.initialize().await.unwrap();

    let mut handles = Vec::new();
    for i in 1..=4u64 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .execute(
                    &format!("SELECT * FROM range({i}) AS r(v)"),
                    &ExecuteOptions::default(),
                )
                .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let rows = handle.await.unwrap().unwrap();
        assert_eq!(rows.total_rows, i + 1);
    }
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn row_window_options_page_through_results() {
    init_tracing();
    let config = CoordinatorConfig {
        use_isolated_backend: false,
        init_sql: Some("CREATE TABLE nums AS SELECT * FROM range(100) AS r(v);".to_string()),
        ..CoordinatorConfig::default()
    };
    let coordinator = ConnectionCoordinator::with_sampler(config, FixedSampler::at(0.3)).unwrap();
    coordinator.initialize().await.unwrap();

    let page = ExecuteOptions {
        limit: Some(10),
        offset: Some(20),
        ..ExecuteOptions::default()
    };
    let rows = coordinator
        .execute("SELECT v FROM nums ORDER BY v", &page)
        .await
        .unwrap();
    assert_eq!(rows.total_rows, 10);

    // A different window is a different cache entry, not a stale hit.
    let other = ExecuteOptions {
        limit: Some(5),
        offset: Some(20),
        ..ExecuteOptions::default()
    };
    let rows = coordinator
        .execute("SELECT v FROM nums ORDER BY v", &other)
        .await
        .unwrap();
    assert_eq!(rows.total_rows, 5);
    assert_eq!(coordinator.cache_stats().misses, 2);

    // A trailing line comment must not swallow the window.
    let rows = coordinator
        .execute("SELECT v FROM nums ORDER BY v -- newest page", &page)
        .await
        .unwrap();
    assert_eq!(rows.total_rows, 10);

    // Nor may the statement's own LIMIT collide with the window's.
    let rows = coordinator
        .execute("SELECT v FROM nums ORDER BY v LIMIT 50", &page)
        .await
        .unwrap();
    assert_eq!(rows.total_rows, 10);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runtime_cache_toggle_changes_lookup_behavior() {
    init_tracing();
    let config = CoordinatorConfig {
        use_isolated_backend: false,
        ..CoordinatorConfig::default()
    };
    let coordinator = ConnectionCoordinator::with_sampler(config, FixedSampler::at(0.3)).unwrap();
    coordinator.initialize().await.unwrap();
    let options = ExecuteOptions::default();

    coordinator.execute("SELECT 1 AS v", &options).await.unwrap();
    coordinator.set_cache_enabled(false);
    coordinator.execute("SELECT 1 AS v", &options).await.unwrap();
    assert_eq!(coordinator.cache_stats().hits, 0);

    coordinator.set_cache_enabled(true);
    coordinator.execute("SELECT 1 AS v", &options).await.unwrap();
    assert_eq!(coordinator.cache_stats().hits, 1);

    coordinator.shutdown().await.unwrap();
}
