//! Watch discipline integration tests.
//!
//! Periodic task lifecycle, delivery ordering, fault isolation and loop
//! termination.

mod common;

use mvent::codec::Value;
use mvent::core::error::{PoolError, PoolResult};
use mvent::pool::store::SharedMemoryPool;
use mvent::watch::source::{SequenceSource, WatchItem, WatchSource};
use mvent::watch::task::{PeriodicTask, TaskState, TickOutcome};
use mvent::watch::manager::WatchOptions;
use mvent::watch::WatchManager;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn chunk(seq: u64, data: impl Into<Value>) -> Value {
    let mut record = Value::map();
    record.insert("seq", seq);
    record.insert("timestamp", 0.0);
    record.insert("data", data);
    record
}

fn collector() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) -> anyhow::Result<()> + Send + Sync) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |v: &Value| {
        sink.lock().push(v.clone());
        Ok(())
    })
}

/// Source that always fails with a fixed error.
struct FailingSource {
    error: PoolError,
}

impl WatchSource for FailingSource {
    fn subscription_key(&self) -> String {
        "failing".to_string()
    }

    fn head(&self, _pool: &SharedMemoryPool) -> PoolResult<Option<u64>> {
        Ok(None)
    }

    fn fetch_after(
        &self,
        _pool: &SharedMemoryPool,
        _cursor: Option<u64>,
    ) -> PoolResult<Vec<WatchItem>> {
        Err(self.error.clone())
    }
}

/// Source whose head read stalls, for observing lock scope in subscribe.
struct StallingHeadSource {
    entered: Arc<AtomicBool>,
    stall: Duration,
}

impl WatchSource for StallingHeadSource {
    fn subscription_key(&self) -> String {
        "stalling".to_string()
    }

    fn head(&self, _pool: &SharedMemoryPool) -> PoolResult<Option<u64>> {
        self.entered.store(true, Ordering::SeqCst);
        std::thread::sleep(self.stall);
        Ok(None)
    }

    fn fetch_after(
        &self,
        _pool: &SharedMemoryPool,
        _cursor: Option<u64>,
    ) -> PoolResult<Vec<WatchItem>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// PeriodicTask
// ============================================================================

#[tokio::test]
async fn task_runs_until_stopped() {
    let task = PeriodicTask::new("ticker", Duration::from_millis(5));
    assert_eq!(task.state(), TaskState::Idle);

    let ticks = Arc::new(AtomicU64::new(0));
    let counter = ticks.clone();
    task.start(move || {
        counter.fetch_add(1, Ordering::Relaxed);
        TickOutcome::Continue
    })
    .unwrap();
    assert!(task.is_watching());

    assert!(common::wait_until(Duration::from_secs(2), || ticks.load(Ordering::Relaxed) >= 3).await);
    assert!(task.stop(Duration::from_secs(1)).await);
    assert_eq!(task.state(), TaskState::Stopped);

    let after_stop = ticks.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(ticks.load(Ordering::Relaxed), after_stop);
}

#[tokio::test]
async fn task_stops_itself_on_stop_outcome() {
    let task = PeriodicTask::new("once", Duration::from_millis(5));
    let ticks = Arc::new(AtomicU64::new(0));
    let counter = ticks.clone();
    task.start(move || {
        counter.fetch_add(1, Ordering::Relaxed);
        TickOutcome::Stop
    })
    .unwrap();

    assert!(common::wait_until(Duration::from_secs(2), || task.state() == TaskState::Stopped).await);
    assert_eq!(ticks.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn task_cannot_start_twice() {
    let task = PeriodicTask::new("twice", Duration::from_millis(5));
    task.start(|| TickOutcome::Continue).unwrap();
    let err = task.start(|| TickOutcome::Continue).unwrap_err();
    assert!(matches!(err, PoolError::InvalidRequest { .. }));
    task.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn stop_before_start_is_terminal() {
    let task = PeriodicTask::new("never", Duration::from_millis(5));
    assert!(task.stop(Duration::from_millis(10)).await);
    assert_eq!(task.state(), TaskState::Stopped);
    assert!(task.start(|| TickOutcome::Continue).is_err());
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn delivers_in_index_order_exactly_once() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = WatchManager::with_options(pool.clone(), common::fast_watch());

    let (seen, callback) = collector();
    manager
        .subscribe(Arc::new(SequenceSource::new("s")), callback)
        .unwrap();

    for seq in 1..=5u64 {
        pool.set(&format!("s:{}", seq), chunk(seq, format!("d{}", seq)), None)
            .unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(3), || seen.lock().len() >= 5).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let expected: Vec<Value> = (1..=5).map(|i| Value::from(format!("d{}", i))).collect();
    assert_eq!(*seen.lock(), expected);
    assert_eq!(manager.cursor("stream:s"), Some(5));

    manager.cleanup().await;
}

#[tokio::test]
async fn late_subscriber_starts_from_now() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    pool.set("s:1", chunk(1, "old"), None).unwrap();
    pool.set("s:2", chunk(2, "older"), None).unwrap();

    let manager = WatchManager::with_options(pool.clone(), common::fast_watch());
    let (seen, callback) = collector();
    manager
        .subscribe(Arc::new(SequenceSource::new("s")), callback)
        .unwrap();
    assert_eq!(manager.cursor("stream:s"), Some(2));

    pool.set("s:3", chunk(3, "new"), None).unwrap();
    assert!(common::wait_until(Duration::from_secs(2), || !seen.lock().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(*seen.lock(), vec![Value::from("new")]);
    manager.cleanup().await;
}

#[tokio::test]
async fn every_callback_on_a_key_receives_each_item() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = WatchManager::with_options(pool.clone(), common::fast_watch());
    let source: Arc<dyn WatchSource> = Arc::new(SequenceSource::new("s"));

    let (first, cb1) = collector();
    let (second, cb2) = collector();
    manager.subscribe(source.clone(), cb1).unwrap();
    manager.subscribe(source, cb2).unwrap();

    pool.set("s:1", chunk(1, "x"), None).unwrap();
    assert!(
        common::wait_until(Duration::from_secs(2), || {
            first.lock().len() == 1 && second.lock().len() == 1
        })
        .await
    );

    assert_eq!(manager.stats("stream:s").unwrap().delivered, 1);
    manager.cleanup().await;
}

#[tokio::test]
async fn joining_callback_skips_items_below_its_join_head() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let slow = WatchOptions {
        poll_interval: Duration::from_millis(300),
        ..common::fast_watch()
    };
    let manager = WatchManager::with_options(pool.clone(), slow);
    let source: Arc<dyn WatchSource> = Arc::new(SequenceSource::new("s"));

    let (early, cb1) = collector();
    manager.subscribe(source.clone(), cb1).unwrap();
    // Let the first immediate tick pass so the loop cursor lags behind.
    tokio::time::sleep(Duration::from_millis(30)).await;

    pool.set("s:1", chunk(1, "before"), None).unwrap();
    let (late, cb2) = collector();
    manager.subscribe(source, cb2).unwrap();
    pool.set("s:2", chunk(2, "after"), None).unwrap();

    assert!(common::wait_until(Duration::from_secs(3), || early.lock().len() >= 2).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(*early.lock(), vec![Value::from("before"), Value::from("after")]);
    assert_eq!(*late.lock(), vec![Value::from("after")]);
    assert_eq!(manager.stats("stream:s").unwrap().delivered, 2);
    manager.cleanup().await;
}

#[tokio::test]
async fn slow_head_read_does_not_block_other_keys() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = Arc::new(WatchManager::with_options(pool, common::fast_watch()));
    manager
        .subscribe(Arc::new(SequenceSource::new("s")), |_| Ok(()))
        .unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let source = StallingHeadSource {
        entered: entered.clone(),
        stall: Duration::from_millis(400),
    };
    let runtime = tokio::runtime::Handle::current();
    let joiner = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            let _guard = runtime.enter();
            manager.subscribe(Arc::new(source), |_| Ok(())).map(|_| ())
        })
    };

    assert!(common::wait_until(Duration::from_secs(2), || entered.load(Ordering::SeqCst)).await);
    let started = std::time::Instant::now();
    assert_eq!(manager.state("stream:s"), Some(TaskState::Watching));
    assert_eq!(manager.active_keys(), vec!["stream:s".to_string()]);
    assert!(started.elapsed() < Duration::from_millis(200));

    joiner.join().unwrap().unwrap();
    assert_eq!(manager.active_keys().len(), 2);
    manager.cleanup().await;
}

#[tokio::test]
async fn failing_callback_does_not_block_others() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = WatchManager::with_options(pool.clone(), common::fast_watch());
    let source: Arc<dyn WatchSource> = Arc::new(SequenceSource::new("s"));

    manager
        .subscribe(source.clone(), |_| anyhow::bail!("handler rejected"))
        .unwrap();
    manager
        .subscribe(source.clone(), |_| panic!("handler exploded"))
        .unwrap();
    let (seen, callback) = collector();
    manager.subscribe(source, callback).unwrap();

    pool.set("s:1", chunk(1, "a"), None).unwrap();
    pool.set("s:2", chunk(2, "b"), None).unwrap();

    assert!(common::wait_until(Duration::from_secs(3), || seen.lock().len() == 2).await);
    assert_eq!(*seen.lock(), vec![Value::from("a"), Value::from("b")]);

    let stats = manager.stats("stream:s").unwrap();
    assert_eq!(stats.callback_faults, 4);
    assert_eq!(manager.state("stream:s"), Some(TaskState::Watching));
    manager.cleanup().await;
}

// ============================================================================
// Loop termination
// ============================================================================

#[tokio::test]
async fn destroyed_pool_stops_loop_after_fault_streak() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "doomed");
    let manager = WatchManager::with_options(pool.clone(), common::fast_watch());
    manager
        .subscribe(Arc::new(SequenceSource::new("s")), |_| Ok(()))
        .unwrap();

    SharedMemoryPool::destroy(dir.path(), "doomed").unwrap();

    assert!(
        common::wait_until(Duration::from_secs(2), || {
            manager.state("stream:s") == Some(TaskState::Stopped)
        })
        .await
    );
    assert!(matches!(
        manager.fault("stream:s"),
        Some(PoolError::StorageFault { .. })
    ));
    assert_eq!(manager.stats("stream:s").unwrap().poll_faults, 2);
}

#[tokio::test]
async fn decryption_fault_stops_loop_immediately() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = WatchManager::with_options(pool, common::fast_watch());
    manager
        .subscribe(
            Arc::new(FailingSource {
                error: PoolError::decryption("key mismatch"),
            }),
            |_| Ok(()),
        )
        .unwrap();

    assert!(
        common::wait_until(Duration::from_secs(2), || {
            manager.state("failing") == Some(TaskState::Stopped)
        })
        .await
    );
    assert_eq!(manager.stats("failing").unwrap().poll_faults, 1);
    assert!(matches!(
        manager.fault("failing"),
        Some(PoolError::DecryptionFault { .. })
    ));
}

#[tokio::test]
async fn resubscribe_after_fault_starts_fresh_instance() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = WatchManager::with_options(pool, common::fast_watch());
    let failing = Arc::new(FailingSource {
        error: PoolError::invalid("bad source"),
    });

    manager.subscribe(failing.clone(), |_| Ok(())).unwrap();
    assert!(
        common::wait_until(Duration::from_secs(2), || {
            manager.state("failing") == Some(TaskState::Stopped)
        })
        .await
    );

    manager.subscribe(failing, |_| Ok(())).unwrap();
    assert_eq!(manager.subscriber_count("failing"), 1);
    assert!(manager.fault("failing").is_none());
    manager.cleanup().await;
}

#[tokio::test]
async fn disconnect_waits_for_loop() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = WatchManager::with_options(pool.clone(), common::fast_watch());
    let (seen, callback) = collector();
    manager
        .subscribe(Arc::new(SequenceSource::new("s")), callback)
        .unwrap();

    assert!(manager.disconnect("stream:s").await);
    assert!(!manager.disconnect("stream:s").await);
    assert!(manager.active_keys().is_empty());

    pool.set("s:1", chunk(1, "ignored"), None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn cleanup_stops_every_loop() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = WatchManager::with_options(pool, common::fast_watch());
    for name in ["a", "b", "c"] {
        manager
            .subscribe(Arc::new(SequenceSource::new(name)), |_| Ok(()))
            .unwrap();
    }
    assert_eq!(manager.active_keys().len(), 3);

    manager.cleanup().await;
    assert!(manager.active_keys().is_empty());
}

#[test]
fn subscribe_outside_runtime_is_rejected() {
    let dir = common::temp_test_dir();
    let pool = common::open_pool(dir.path(), "watch");
    let manager = WatchManager::new(pool);
    let err = manager
        .subscribe(Arc::new(SequenceSource::new("s")), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidRequest { .. }));
}
