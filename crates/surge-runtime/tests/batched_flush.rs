use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use surge_core::types::{SinkConfig, SinkMode};
use surge_runtime::pipeline::Pipeline;
use surge_runtime::store::MemoryStore;

fn batched(batch_size: usize, flush_interval: Duration) -> SinkConfig {
    SinkConfig {
        workers: 1,
        batch_size,
        flush_interval,
        channel_capacity: 1024,
        ..SinkConfig::with_mode(SinkMode::BatchedMulti)
    }
}

fn payloads(store: &MemoryStore) -> Vec<Vec<String>> {
    store
        .statements()
        .iter()
        .map(|s| {
            s.params()
                .iter()
                .map(|m| m.to_text_lossy().into_owned())
                .collect()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn size_flushes_then_timer_flushes_remainder() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::start(batched(3, Duration::from_secs(1)), store.clone())?;
    let handle = pipeline.handle();

    for i in 1..=7 {
        handle.deliver(format!("M{i}")).await?;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.param_counts(), vec![3, 3]);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(store.param_counts(), vec![3, 3, 1]);
    assert_eq!(
        payloads(&store),
        vec![
            vec!["M1", "M2", "M3"],
            vec!["M4", "M5", "M6"],
            vec!["M7"],
        ]
    );
    assert_eq!(
        store.statements()[0].sql(),
        "INSERT INTO messages (payload) VALUES ($1),($2),($3)"
    );

    let metrics = pipeline.metrics();
    assert_eq!(metrics.size_flushes_total.get(), 2);
    assert_eq!(metrics.timer_flushes_total.get(), 1);

    drop(handle);
    let report = pipeline.shutdown().await?;
    assert_eq!(report.progress.attempted, 7);
    assert_eq!(report.statements, 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lone_message_is_flushed_by_timer() -> Result<()> {
    let interval = Duration::from_millis(100);
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::start(batched(5, interval), store.clone())?;
    let handle = pipeline.handle();

    handle.deliver("only").await?;
    tokio::time::sleep(interval * 2).await;

    assert_eq!(payloads(&store), vec![vec!["only"]]);
    let metrics = pipeline.metrics();
    assert_eq!(metrics.timer_flushes_total.get(), 1);
    assert_eq!(metrics.size_flushes_total.get(), 0);

    drop(handle);
    pipeline.shutdown().await?;
    assert_eq!(store.param_counts(), vec![1]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timer_wins_when_it_fires_with_the_filling_message() -> Result<()> {
    let interval = Duration::from_millis(100);
    let start = Instant::now();
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::start(batched(3, interval), store.clone())?;
    let handle = pipeline.handle();

    handle.deliver("t1").await?;
    handle.deliver("t2").await?;
    tokio::time::sleep_until(start + interval).await;
    handle.deliver("t3").await?;
    tokio::time::sleep_until(start + interval * 2 + Duration::from_millis(10)).await;

    assert_eq!(store.param_counts(), vec![2, 1]);
    assert_eq!(payloads(&store), vec![vec!["t1", "t2"], vec!["t3"]]);
    let metrics = pipeline.metrics();
    assert_eq!(metrics.timer_flushes_total.get(), 2);
    assert_eq!(metrics.size_flushes_total.get(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_batch_is_dropped_and_still_counted() -> Result<()> {
    let first = AtomicBool::new(true);
    let store = Arc::new(
        MemoryStore::new().with_failures(move |_| first.swap(false, Ordering::SeqCst)),
    );
    let pipeline = Pipeline::start(batched(3, Duration::from_secs(1)), store.clone())?;
    let handle = pipeline.handle();

    for i in 1..=7 {
        handle.deliver(format!("F{i}")).await?;
    }
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    assert_eq!(store.attempts(), 3);
    assert_eq!(payloads(&store), vec![vec!["F4", "F5", "F6"], vec!["F7"]]);
    let progress = pipeline.progress();
    assert_eq!(progress.attempted, 7);
    assert_eq!(progress.persisted, 4);
    assert_eq!(progress.failed(), 3);

    let metrics = pipeline.metrics();
    assert_eq!(metrics.failed_statements_total.get(), 1);
    assert_eq!(metrics.messages_failed_total.get(), 3);
    assert_eq!(metrics.size_flushes_total.get(), 2);
    assert_eq!(metrics.timer_flushes_total.get(), 1);

    drop(handle);
    let report = pipeline.shutdown().await?;
    assert_eq!(report.failed_statements, 1);
    assert_eq!(report.progress.attempted, 7);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn partial_batch_flushes_within_one_interval_of_last_append() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::start(batched(10, Duration::from_millis(100)), store.clone())?;
    let handle = pipeline.handle();

    for i in 0..3 {
        handle.deliver(format!("p{i}")).await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.deliver("p3").await?;

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(store.statements().is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.param_counts(), vec![4]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_held_batch() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::start(batched(100, Duration::from_secs(3600)), store.clone())?;
    let handle = pipeline.handle();

    for i in 0..5 {
        handle.deliver(format!("s{i}")).await?;
    }
    drop(handle);
    let metrics = pipeline.metrics();
    let report = pipeline.shutdown().await?;

    assert_eq!(store.param_counts(), vec![5]);
    assert_eq!(metrics.shutdown_flushes_total.get(), 1);
    assert_eq!(report.progress.persisted, 5);
    assert_eq!(report.abandoned, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn abort_flushes_held_batch() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::start(batched(100, Duration::from_secs(3600)), store.clone())?;
    let handle = pipeline.handle();

    for i in 0..5 {
        handle.deliver(format!("a{i}")).await?;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;

    let report = pipeline.abort().await?;
    assert_eq!(store.param_counts(), vec![5]);
    assert_eq!(report.abandoned, 0);
    assert!(handle.deliver("late").await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn size_flushes_never_exceed_threshold() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let cfg = SinkConfig {
        workers: 4,
        ..batched(7, Duration::from_secs(3600))
    };
    let pipeline = Pipeline::start(cfg, store.clone())?;
    let handle = pipeline.handle();

    for i in 0..1_000 {
        handle.deliver(format!("b{i}")).await?;
    }
    drop(handle);
    let metrics = pipeline.metrics();
    let report = pipeline.shutdown().await?;

    let counts = store.param_counts();
    assert!(counts.iter().all(|&n| (1..=7).contains(&n)), "{counts:?}");
    assert_eq!(counts.iter().sum::<usize>(), 1_000);
    assert_eq!(metrics.timer_flushes_total.get(), 0);
    assert!(metrics.shutdown_flushes_total.get() <= 4);
    let size_flushed = metrics.size_flushes_total.get() * 7;
    assert!(size_flushed <= 1_000 && 1_000 - size_flushed < 4 * 7);
    assert_eq!(report.progress.attempted, 1_000);
    Ok(())
}
