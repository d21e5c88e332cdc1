//! Rolling sample windows and overload queries
//!
//! The snapshotter keeps a bounded history of monitor samples per resource
//! and derives load ratios from them. The autoscaled pool consults it on
//! every tick.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use super::{
    ClientSnapshot, CpuSnapshot, EventLoopSnapshot, LoadRatioInfo, MemorySnapshot, SystemInfo,
};

/// Tuning knobs for the snapshotter.
#[derive(Debug, Clone)]
pub struct SnapshotterOptions {
    /// Maximum number of samples retained per resource.
    pub max_samples: usize,
    /// Window used when computing load ratios.
    pub load_ratio_window: Duration,
    /// Load-ratio limit above which the CPU counts as overloaded.
    pub cpu_overload_limit: f64,
    /// Load-ratio limit above which memory counts as overloaded.
    pub memory_overload_limit: f64,
    pub event_loop_overload_limit: f64,
    pub client_overload_limit: f64,
}

impl Default for SnapshotterOptions {
    fn default() -> Self {
        Self {
            max_samples: 60,
            load_ratio_window: Duration::from_secs(5),
            cpu_overload_limit: 0.4,
            memory_overload_limit: 0.6,
            event_loop_overload_limit: 0.6,
            client_overload_limit: 0.3,
        }
    }
}

/// Bounded rolling windows of system samples with overload queries.
pub struct Snapshotter {
    options: SnapshotterOptions,
    cpu: Mutex<VecDeque<CpuSnapshot>>,
    memory: Mutex<VecDeque<MemorySnapshot>>,
    event_loop: Mutex<VecDeque<EventLoopSnapshot>>,
    client: Mutex<VecDeque<ClientSnapshot>>,
}

impl Default for Snapshotter {
    fn default() -> Self {
        Self::new(SnapshotterOptions::default())
    }
}

impl Snapshotter {
    #[must_use]
    pub fn new(options: SnapshotterOptions) -> Self {
        Self {
            options,
            cpu: Mutex::new(VecDeque::new()),
            memory: Mutex::new(VecDeque::new()),
            event_loop: Mutex::new(VecDeque::new()),
            client: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn options(&self) -> &SnapshotterOptions {
        &self.options
    }

    pub fn add_cpu_snapshot(&self, snapshot: CpuSnapshot) {
        let mut window = self.cpu.lock();
        window.push_back(snapshot);
        while window.len() > self.options.max_samples {
            window.pop_front();
        }
    }

    pub fn add_memory_snapshot(&self, snapshot: MemorySnapshot) {
        let mut window = self.memory.lock();
        window.push_back(snapshot);
        while window.len() > self.options.max_samples {
            window.pop_front();
        }
    }

    pub fn add_event_loop_snapshot(&self, snapshot: EventLoopSnapshot) {
        let mut window = self.event_loop.lock();
        window.push_back(snapshot);
        while window.len() > self.options.max_samples {
            window.pop_front();
        }
    }

    pub fn add_client_snapshot(&self, snapshot: ClientSnapshot) {
        let mut window = self.client.lock();
        window.push_back(snapshot);
        while window.len() > self.options.max_samples {
            window.pop_front();
        }
    }

    /// CPU samples whose timestamps fall within the last `duration`.
    /// `None` returns the whole retained window.
    #[must_use]
    pub fn get_cpu_samples(&self, duration: Option<Duration>) -> Vec<CpuSnapshot> {
        Self::filter_window(&self.cpu.lock(), duration, |s| s.created_at)
    }

    #[must_use]
    pub fn get_memory_samples(&self, duration: Option<Duration>) -> Vec<MemorySnapshot> {
        Self::filter_window(&self.memory.lock(), duration, |s| s.created_at)
    }

    #[must_use]
    pub fn get_event_loop_samples(&self, duration: Option<Duration>) -> Vec<EventLoopSnapshot> {
        Self::filter_window(&self.event_loop.lock(), duration, |s| s.created_at)
    }

    #[must_use]
    pub fn get_client_samples(&self, duration: Option<Duration>) -> Vec<ClientSnapshot> {
        Self::filter_window(&self.client.lock(), duration, |s| s.created_at)
    }

    fn filter_window<T: Copy>(
        window: &VecDeque<T>,
        duration: Option<Duration>,
        created_at: impl Fn(&T) -> Instant,
    ) -> Vec<T> {
        match duration {
            None => window.iter().copied().collect(),
            Some(duration) => {
                let now = Instant::now();
                window
                    .iter()
                    .filter(|sample| now.duration_since(created_at(sample)) <= duration)
                    .copied()
                    .collect()
            }
        }
    }

    fn load_ratio(overloaded: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            overloaded as f64 / total as f64
        }
    }

    #[must_use]
    pub fn cpu_info(&self) -> LoadRatioInfo {
        let samples = self.get_cpu_samples(Some(self.options.load_ratio_window));
        let overloaded = samples.iter().filter(|s| s.is_overloaded()).count();
        LoadRatioInfo {
            limit_ratio: self.options.cpu_overload_limit,
            actual_ratio: Self::load_ratio(overloaded, samples.len()),
        }
    }

    #[must_use]
    pub fn memory_info(&self) -> LoadRatioInfo {
        let samples = self.get_memory_samples(Some(self.options.load_ratio_window));
        let overloaded = samples.iter().filter(|s| s.is_overloaded()).count();
        LoadRatioInfo {
            limit_ratio: self.options.memory_overload_limit,
            actual_ratio: Self::load_ratio(overloaded, samples.len()),
        }
    }

    #[must_use]
    pub fn event_loop_info(&self) -> LoadRatioInfo {
        let samples = self.get_event_loop_samples(Some(self.options.load_ratio_window));
        let overloaded = samples.iter().filter(|s| s.is_overloaded()).count();
        LoadRatioInfo {
            limit_ratio: self.options.event_loop_overload_limit,
            actual_ratio: Self::load_ratio(overloaded, samples.len()),
        }
    }

    #[must_use]
    pub fn client_info(&self) -> LoadRatioInfo {
        let samples = self.get_client_samples(Some(self.options.load_ratio_window));
        let overloaded = samples.iter().filter(|s| s.is_overloaded()).count();
        LoadRatioInfo {
            limit_ratio: self.options.client_overload_limit,
            actual_ratio: Self::load_ratio(overloaded, samples.len()),
        }
    }

    /// Aggregated status over the configured load-ratio window.
    #[must_use]
    pub fn get_system_info(&self) -> SystemInfo {
        SystemInfo {
            cpu_info: self.cpu_info(),
            memory_info: self.memory_info(),
            event_loop_info: self.event_loop_info(),
            client_info: self.client_info(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_cpu_overloaded(&self) -> bool {
        self.cpu_info().is_overloaded()
    }

    #[must_use]
    pub fn is_memory_overloaded(&self) -> bool {
        self.memory_info().is_overloaded()
    }

    #[must_use]
    pub fn is_event_loop_overloaded(&self) -> bool {
        self.event_loop_info().is_overloaded()
    }

    #[must_use]
    pub fn is_client_overloaded(&self) -> bool {
        self.client_info().is_overloaded()
    }

    /// True iff none of the tracked resources is overloaded.
    #[must_use]
    pub fn is_system_idle(&self) -> bool {
        self.get_system_info().is_system_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_sample(used_ratio: f64) -> CpuSnapshot {
        CpuSnapshot {
            used_ratio,
            max_used_ratio: 0.95,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn empty_window_is_idle() {
        let snapshotter = Snapshotter::default();
        assert!(snapshotter.is_system_idle());
        assert_eq!(snapshotter.cpu_info().actual_ratio, 0.0);
    }

    #[test]
    fn load_ratio_counts_overloaded_samples() {
        let snapshotter = Snapshotter::default();
        snapshotter.add_cpu_snapshot(cpu_sample(0.1));
        snapshotter.add_cpu_snapshot(cpu_sample(1.0));
        snapshotter.add_cpu_snapshot(cpu_sample(1.0));
        snapshotter.add_cpu_snapshot(cpu_sample(0.2));
        let info = snapshotter.cpu_info();
        assert!((info.actual_ratio - 0.5).abs() < f64::EPSILON);
        assert!(info.is_overloaded());
        assert!(!snapshotter.is_system_idle());
    }

    #[test]
    fn window_is_bounded() {
        let snapshotter = Snapshotter::new(SnapshotterOptions {
            max_samples: 3,
            ..SnapshotterOptions::default()
        });
        for _ in 0..10 {
            snapshotter.add_cpu_snapshot(cpu_sample(0.0));
        }
        assert_eq!(snapshotter.get_cpu_samples(None).len(), 3);
    }

    #[test]
    fn duration_filter_excludes_old_samples() {
        let snapshotter = Snapshotter::default();
        let old = CpuSnapshot {
            used_ratio: 1.0,
            max_used_ratio: 0.95,
            created_at: Instant::now() - Duration::from_secs(60),
        };
        snapshotter.add_cpu_snapshot(old);
        snapshotter.add_cpu_snapshot(cpu_sample(0.0));
        assert_eq!(
            snapshotter
                .get_cpu_samples(Some(Duration::from_secs(5)))
                .len(),
            1
        );
        // Stale overloaded sample no longer influences the ratio.
        assert!(!snapshotter.cpu_info().is_overloaded());
    }
}
