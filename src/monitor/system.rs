//! System sampler
//!
//! Samples CPU usage, resident memory of this process (plus children),
//! event-loop tick latency and the client-error counter at a fixed interval,
//! feeding each sample into the snapshotter and publishing the aggregated
//! [`SystemInfo`] on the event bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;

use crate::events::{Event, EventManager};

use super::{ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, Snapshotter};

/// Tuning knobs for the system monitor.
#[derive(Debug, Clone)]
pub struct SystemMonitorOptions {
    /// Sampling period.
    pub interval: Duration,
    /// CPU used ratio above which a single sample counts as overloaded.
    pub max_used_cpu_ratio: f64,
    /// Memory ceiling. Defaults to a quarter of total system memory.
    pub max_memory_bytes: Option<u64>,
    /// Ratio of the ceiling above which a memory sample counts as overloaded.
    pub max_used_memory_ratio: f64,
    /// Tick delay above which an event-loop sample counts as overloaded.
    pub max_event_loop_delay: Duration,
    /// Client errors per tick above which a client sample counts as overloaded.
    pub max_client_errors: u32,
}

impl Default for SystemMonitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_used_cpu_ratio: 0.95,
            max_memory_bytes: None,
            max_used_memory_ratio: 0.9,
            max_event_loop_delay: Duration::from_millis(50),
            max_client_errors: 1,
        }
    }
}

/// Periodic sampler of system load signals.
pub struct SystemMonitor {
    snapshotter: Arc<Snapshotter>,
    events: Arc<EventManager>,
    options: SystemMonitorOptions,
    client_errors: AtomicU32,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SystemMonitor {
    #[must_use]
    pub fn new(
        snapshotter: Arc<Snapshotter>,
        events: Arc<EventManager>,
        options: SystemMonitorOptions,
    ) -> Self {
        Self {
            snapshotter,
            events,
            options,
            client_errors: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Record an HTTP 429/503-equivalent event; consumed on the next tick.
    pub fn register_client_error(&self) {
        self.client_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Start the sampling loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock();
        if guard.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            monitor.sampling_loop().await;
        }));
    }

    /// Stop sampling. In-flight tick finishes; no further samples are taken.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn sampling_loop(self: Arc<Self>) {
        let mut sys = System::new();
        sys.refresh_memory();
        let max_memory_bytes = self
            .options
            .max_memory_bytes
            .unwrap_or_else(|| sys.total_memory() / 4);
        debug!(
            "System monitor started (interval {:?}, memory ceiling {} bytes)",
            self.options.interval, max_memory_bytes
        );

        let own_pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot determine own PID, memory sampling limited: {e}");
                None
            }
        };

        loop {
            let scheduled = Instant::now();
            tokio::time::sleep(self.options.interval).await;
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let now = Instant::now();

            // Event-loop latency: how late the tick actually fired.
            let delay = now
                .duration_since(scheduled)
                .saturating_sub(self.options.interval);
            self.snapshotter.add_event_loop_snapshot(EventLoopSnapshot {
                delay,
                max_delay: self.options.max_event_loop_delay,
                created_at: now,
            });

            // CPU: usage since the previous refresh, one tick ago.
            sys.refresh_cpu_usage();
            let used_ratio = f64::from(sys.global_cpu_usage()) / 100.0;
            self.snapshotter.add_cpu_snapshot(CpuSnapshot {
                used_ratio: used_ratio.clamp(0.0, 1.0),
                max_used_ratio: self.options.max_used_cpu_ratio,
                created_at: now,
            });

            // Memory: own RSS plus children, recursively.
            if let Some(pid) = own_pid {
                sys.refresh_processes(ProcessesToUpdate::All, true);
                let current_bytes = process_tree_memory(&sys, pid);
                self.snapshotter.add_memory_snapshot(MemorySnapshot {
                    current_bytes,
                    max_memory_bytes,
                    max_used_memory_ratio: self.options.max_used_memory_ratio,
                    created_at: now,
                });
            }

            // Client errors accumulated since the previous tick.
            let error_count = self.client_errors.swap(0, Ordering::Relaxed);
            self.snapshotter.add_client_snapshot(ClientSnapshot {
                error_count,
                max_error_count: self.options.max_client_errors,
                created_at: now,
            });

            self.events.emit(Event::SystemInfo {
                info: self.snapshotter.get_system_info(),
            });
        }
    }
}

/// Sum the resident memory of `root` and every transitive child.
fn process_tree_memory(sys: &System, root: Pid) -> u64 {
    let mut total = 0;
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(process) = sys.process(pid) {
            total += process.memory();
        }
        for (child_pid, process) in sys.processes() {
            if process.parent() == Some(pid) {
                stack.push(*child_pid);
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_errors_are_consumed_per_tick() {
        let snapshotter = Arc::new(Snapshotter::default());
        let events = Arc::new(EventManager::default());
        let monitor = Arc::new(SystemMonitor::new(
            Arc::clone(&snapshotter),
            events,
            SystemMonitorOptions {
                interval: Duration::from_millis(10),
                ..SystemMonitorOptions::default()
            },
        ));

        monitor.register_client_error();
        monitor.register_client_error();
        monitor.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.stop();

        let samples = snapshotter.get_client_samples(None);
        assert!(!samples.is_empty());
        // The two registered errors show up in exactly one sample.
        let total: u32 = samples.iter().map(|s| s.error_count).sum();
        assert_eq!(total, 2);
        assert_eq!(samples[0].error_count, 2);
        assert!(samples[0].is_overloaded());
    }

    #[tokio::test]
    async fn monitor_publishes_system_info_events() {
        let snapshotter = Arc::new(Snapshotter::default());
        let events = Arc::new(EventManager::default());
        let monitor = Arc::new(SystemMonitor::new(
            snapshotter,
            Arc::clone(&events),
            SystemMonitorOptions {
                interval: Duration::from_millis(10),
                ..SystemMonitorOptions::default()
            },
        ));
        let mut receiver = events.subscribe();
        monitor.start();

        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("monitor should publish within 5s")
            .expect("bus should stay open");
        assert!(matches!(event, Event::SystemInfo { .. }));
        monitor.stop();
    }
}
