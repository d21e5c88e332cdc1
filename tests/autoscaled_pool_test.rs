//! Autoscaled pool behavior under the global rate cap

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crawlkit::{AutoscaledPool, AutoscaledPoolOptions, Snapshotter};

#[tokio::test]
async fn worker_starts_respect_the_per_minute_cap() {
    let pool = Arc::new(AutoscaledPool::new(
        AutoscaledPoolOptions {
            min_concurrency: 4,
            max_concurrency: 4,
            max_tasks_per_minute: Some(2),
            autoscale_interval: Duration::from_millis(20),
            idle_poll_interval: Duration::from_millis(5),
            ..AutoscaledPoolOptions::default()
        },
        Arc::new(Snapshotter::default()),
    ));

    let started = Arc::new(AtomicUsize::new(0));

    let started_in_task = Arc::clone(&started);
    let run_task: crawlkit::pool::RunTaskFn = Arc::new(move || {
        let started = Arc::clone(&started_in_task);
        Box::pin(async move {
            started.fetch_add(1, Ordering::AcqRel);
        })
    });
    let is_task_ready: crawlkit::pool::PredicateFn = Arc::new(|| Box::pin(async { true }));
    let is_finished: crawlkit::pool::PredicateFn = Arc::new(|| Box::pin(async { false }));

    let pool_for_abort = Arc::clone(&pool);
    tokio::spawn(async move {
        // Give the pool plenty of scheduler rounds to overshoot if it could.
        tokio::time::sleep(Duration::from_millis(500)).await;
        pool_for_abort.abort();
    });

    tokio::time::timeout(
        Duration::from_secs(10),
        pool.run(run_task, is_task_ready, is_finished),
    )
    .await
    .expect("aborted pool terminates");

    // Only the capped number of workers may start within the 60 s window.
    assert_eq!(started.load(Ordering::Acquire), 2);
}
