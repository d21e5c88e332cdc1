//! System monitoring and load snapshots
//!
//! The monitor samples CPU, memory, event-loop latency and client-error
//! signals at a fixed interval and feeds the [`Snapshotter`], which keeps
//! rolling windows of those samples and answers "is this resource
//! overloaded?" queries for the autoscaled pool.

pub mod snapshotter;
pub mod system;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use snapshotter::{Snapshotter, SnapshotterOptions};
pub use system::{SystemMonitor, SystemMonitorOptions};

/// Load ratio of a single resource over the sample window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRatioInfo {
    /// Maximum acceptable ratio of overloaded to total samples.
    pub limit_ratio: f64,
    /// Actual ratio of overloaded to total samples.
    pub actual_ratio: f64,
}

impl LoadRatioInfo {
    /// Whether the resource is currently considered overloaded.
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.actual_ratio > self.limit_ratio
    }
}

/// Aggregated system status, published on the event bus every monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub cpu_info: LoadRatioInfo,
    pub memory_info: LoadRatioInfo,
    pub event_loop_info: LoadRatioInfo,
    pub client_info: LoadRatioInfo,
    pub created_at: DateTime<Utc>,
}

impl SystemInfo {
    /// True iff no resource is overloaded.
    #[must_use]
    pub fn is_system_idle(&self) -> bool {
        !self.cpu_info.is_overloaded()
            && !self.memory_info.is_overloaded()
            && !self.event_loop_info.is_overloaded()
            && !self.client_info.is_overloaded()
    }
}

/// A single CPU usage sample.
#[derive(Debug, Clone, Copy)]
pub struct CpuSnapshot {
    /// Ratio of CPU currently in use, in `[0, 1]`.
    pub used_ratio: f64,
    /// Maximum acceptable used ratio.
    pub max_used_ratio: f64,
    pub created_at: Instant,
}

impl CpuSnapshot {
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.used_ratio > self.max_used_ratio
    }
}

/// A single memory usage sample.
#[derive(Debug, Clone, Copy)]
pub struct MemorySnapshot {
    /// RSS of this process plus its children.
    pub current_bytes: u64,
    /// Memory ceiling the pool is allowed to use.
    pub max_memory_bytes: u64,
    /// Maximum acceptable ratio of `current_bytes` to `max_memory_bytes`.
    pub max_used_memory_ratio: f64,
    pub created_at: Instant,
}

impl MemorySnapshot {
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        if self.max_memory_bytes == 0 {
            return false;
        }
        (self.current_bytes as f64 / self.max_memory_bytes as f64) > self.max_used_memory_ratio
    }
}

/// A single event-loop latency sample: the delay between the scheduled and
/// actual tick of the monitor loop.
#[derive(Debug, Clone, Copy)]
pub struct EventLoopSnapshot {
    pub delay: Duration,
    pub max_delay: Duration,
    pub created_at: Instant,
}

impl EventLoopSnapshot {
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.delay > self.max_delay
    }
}

/// A single client-error sample: rate-limit-like responses since last tick.
#[derive(Debug, Clone, Copy)]
pub struct ClientSnapshot {
    pub error_count: u32,
    pub max_error_count: u32,
    pub created_at: Instant,
}

impl ClientSnapshot {
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.error_count > self.max_error_count
    }
}
