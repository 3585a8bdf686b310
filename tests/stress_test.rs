//! Stress tests for pools and workers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft::prelude::*;

#[test]
#[ignore] // Run with --ignored flag
fn stress_test_many_small_tasks() {
    let mut pool = TaskPool::new(8).unwrap();
    for i in 0..10_000u64 {
        pool.submit(TaskDescriptor::from_fn(format!("t{}", i), move |_| Ok(i * 2)))
            .unwrap();
    }

    let total: u64 = pool
        .get_all_results()
        .iter()
        .filter_map(|r| r.value().copied())
        .sum();
    assert_eq!(total, 2 * (0..10_000u64).sum::<u64>());
    assert_eq!(pool.stats().tasks_completed, 10_000);
}

#[test]
#[ignore]
fn stress_test_backlog_pressure() {
    let config = Config::builder()
        .pool_size(2)
        .backlog_capacity(4)
        .build()
        .unwrap();
    let mut pool = TaskPool::with_config(config).unwrap();

    for i in 0..500 {
        pool.submit(TaskDescriptor::from_fn(format!("t{}", i), |_| {
            std::thread::sleep(Duration::from_micros(200));
            Ok(())
        }))
        .unwrap();
    }

    pool.wait_all();
    assert!(pool.errors().is_none());
}

#[test]
#[ignore]
fn stress_test_parallel_batches() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut pool = TaskPool::new(8).unwrap();
    pool.set_parallel(Some(3)).unwrap();

    for i in 0..300 {
        let running = running.clone();
        let peak = peak.clone();
        pool.submit(TaskDescriptor::from_fn(format!("t{}", i), move |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(100));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    }

    pool.close().unwrap();
    assert!(peak.load(Ordering::SeqCst) <= 3);
}

#[test]
#[ignore]
fn stress_test_worker_churn() {
    let manager = WorkerManager::new(Arc::new(InitializerRegistry::new()));

    for round in 0..200 {
        let record = manager
            .spawn(&format!("churn-{}", round), move |ctx| {
                ctx.check()?;
                Ok(round)
            })
            .unwrap();
        assert!(manager.join(record.id(), Some(Duration::from_secs(5))).unwrap());
        let reaped = manager.reap(record.id()).unwrap();
        assert_eq!(reaped.take_result::<i32>(), Some(round));
    }

    assert!(manager.is_empty());
}
