//! Shared helpers for integration tests
#![allow(dead_code)]

use std::time::Duration;

use crawlkit::{AutoscaledPoolOptions, CrawlerOptions};

/// Crawler options tuned for fast test turnaround: quick control-loop ticks,
/// small concurrency ceiling.
#[must_use]
pub fn fast_options() -> CrawlerOptions {
    CrawlerOptions {
        autoscaling: AutoscaledPoolOptions {
            min_concurrency: 1,
            max_concurrency: 4,
            autoscale_interval: Duration::from_millis(20),
            idle_poll_interval: Duration::from_millis(5),
            ..AutoscaledPoolOptions::default()
        },
        ..CrawlerOptions::default()
    }
}

/// Like [`fast_options`] but pinned to a single worker, for tests that
/// assert processing order.
#[must_use]
pub fn single_worker_options() -> CrawlerOptions {
    let mut options = fast_options();
    options.autoscaling.max_concurrency = 1;
    options
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
