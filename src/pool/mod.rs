//! Autoscaled worker pool
//!
//! Drives concurrency between a configured minimum and maximum: a control
//! tick consults the snapshotter and ramps the desired concurrency down when
//! any resource is overloaded, up when the system has stayed idle and there
//! is queued work. Worker slots are filled with task futures supplied by the
//! driver, throttled by a global starts-per-minute cap.

pub mod rate_limiter;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::monitor::Snapshotter;

pub use rate_limiter::TaskRateLimiter;

/// Produces one unit of work. The future resolves when the unit is done;
/// errors are handled inside (the pool only schedules).
pub type RunTaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Async predicate consulted by the pool.
pub type PredicateFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Tuning knobs for the autoscaled pool.
#[derive(Debug, Clone)]
pub struct AutoscaledPoolOptions {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Cap on worker starts per minute, over any 60 s window.
    pub max_tasks_per_minute: Option<u32>,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Control-loop tick period.
    pub autoscale_interval: Duration,
    /// Overload-free time required before scaling up again.
    pub scale_up_cooldown: Duration,
    /// Sleep between polls while the pool is idle but not finished.
    pub idle_poll_interval: Duration,
}

impl Default for AutoscaledPoolOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            max_tasks_per_minute: None,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            autoscale_interval: Duration::from_secs(1),
            scale_up_cooldown: Duration::from_secs(10),
            idle_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Worker pool that adapts its concurrency to live system signals.
pub struct AutoscaledPool {
    options: AutoscaledPoolOptions,
    snapshotter: Arc<Snapshotter>,
    rate_limiter: TaskRateLimiter,
    desired_concurrency: AtomicUsize,
    current_concurrency: AtomicUsize,
    last_overloaded_at: Mutex<Option<Instant>>,
    aborted: AtomicBool,
}

impl AutoscaledPool {
    #[must_use]
    pub fn new(options: AutoscaledPoolOptions, snapshotter: Arc<Snapshotter>) -> Self {
        let rate_limiter = TaskRateLimiter::new(options.max_tasks_per_minute);
        let desired = options.min_concurrency.max(1);
        Self {
            options,
            snapshotter,
            rate_limiter,
            desired_concurrency: AtomicUsize::new(desired),
            current_concurrency: AtomicUsize::new(0),
            last_overloaded_at: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn desired_concurrency(&self) -> usize {
        self.desired_concurrency.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency.load(Ordering::Acquire)
    }

    /// Cancel all workers at the next opportunity.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// One control-loop step: adjust desired concurrency from the
    /// snapshotter's overload verdict and the presence of queued work.
    pub fn autoscale_tick(&self, has_queued_work: bool) {
        let desired = self.desired_concurrency();
        if !self.snapshotter.is_system_idle() {
            *self.last_overloaded_at.lock() = Some(Instant::now());
            let step = scale_step(desired, self.options.scale_down_step_ratio);
            let next = desired
                .saturating_sub(step)
                .max(self.options.min_concurrency);
            if next != desired {
                debug!("Scaling down: desired concurrency {desired} -> {next}");
                self.desired_concurrency.store(next, Ordering::Release);
            }
            return;
        }

        let cooled_down = self
            .last_overloaded_at
            .lock()
            .is_none_or(|at| at.elapsed() >= self.options.scale_up_cooldown);
        let saturated = self.current_concurrency() >= desired;

        if saturated && cooled_down && has_queued_work && desired < self.options.max_concurrency {
            let step = scale_step(desired, self.options.scale_up_step_ratio);
            let next = (desired + step).min(self.options.max_concurrency);
            debug!("Scaling up: desired concurrency {desired} -> {next}");
            self.desired_concurrency.store(next, Ordering::Release);
        }
    }

    /// Run the pool until `is_finished` reports true and all workers have
    /// drained, or until [`AutoscaledPool::abort`] is called.
    pub async fn run(
        &self,
        run_task: RunTaskFn,
        is_task_ready: PredicateFn,
        is_finished: PredicateFn,
    ) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_autoscale = Instant::now();
        info!(
            "Autoscaled pool started (min {}, max {})",
            self.options.min_concurrency, self.options.max_concurrency
        );

        loop {
            if self.is_aborted() {
                info!("Autoscaled pool aborted, cancelling {} workers", tasks.len());
                tasks.abort_all();
                break;
            }

            if last_autoscale.elapsed() >= self.options.autoscale_interval {
                self.autoscale_tick(is_task_ready().await);
                last_autoscale = Instant::now();
            }

            // Fill worker slots up to the desired concurrency.
            while tasks.len() < self.desired_concurrency() && !self.is_aborted() {
                if !is_task_ready().await {
                    break;
                }
                if self.rate_limiter.try_acquire().is_err() {
                    break;
                }
                tasks.spawn(run_task());
            }
            self.current_concurrency.store(tasks.len(), Ordering::Release);

            if tasks.is_empty() {
                if is_finished().await {
                    break;
                }
                tokio::time::sleep(self.options.idle_poll_interval).await;
            } else {
                tokio::select! {
                    joined = tasks.join_next() => {
                        if let Some(Err(e)) = joined
                            && !e.is_cancelled()
                        {
                            error!("Worker task panicked: {e}");
                        }
                    }
                    () = tokio::time::sleep(self.options.autoscale_interval) => {}
                }
                self.current_concurrency.store(tasks.len(), Ordering::Release);
            }
        }

        // Drain whatever is left (finished workers after abort, stragglers).
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined
                && !e.is_cancelled()
            {
                error!("Worker task panicked during drain: {e}");
            }
        }
        self.current_concurrency.store(0, Ordering::Release);
        info!("Autoscaled pool drained");
    }
}

/// Multiplicative scaling step, at least 1.
fn scale_step(desired: usize, ratio: f64) -> usize {
    ((desired as f64 * ratio).ceil() as usize).max(1)
}
