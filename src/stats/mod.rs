//! Run statistics
//!
//! Counters, duration aggregates and the retry histogram for a crawler run.
//! The state is periodically persisted to a key-value store (keyed by
//! `stats_id`) and merged back on startup so interrupted runs can resume
//! without losing their numbers.

pub mod error_tracker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::storage::{KeyValueStore, StorageError};

pub use error_tracker::{ErrorGroup, ErrorTracker, ErrorTrackerOptions, generic_message};

static NEXT_STATS_ID: AtomicU64 = AtomicU64::new(0);

/// Persisted statistics document. Unknown fields in stored documents are
/// ignored on load, so newer writers stay compatible with older readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsState {
    pub stats_id: u64,
    pub requests_finished: u64,
    pub requests_failed: u64,
    /// `retry_histogram[i]` counts requests finished after `i` retries.
    pub retry_histogram: Vec<u64>,
    pub request_total_finished_duration_millis: u64,
    pub request_total_failed_duration_millis: u64,
    pub request_max_duration_millis: u64,
    pub crawler_runtime_millis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_last_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_finished_at: Option<DateTime<Utc>>,
}

impl StatisticsState {
    /// Merge a previously persisted state into this one: counters and
    /// durations sum, maxima take the larger value.
    pub fn merge_previous(&mut self, previous: &StatisticsState) {
        self.requests_finished += previous.requests_finished;
        self.requests_failed += previous.requests_failed;
        self.request_total_finished_duration_millis +=
            previous.request_total_finished_duration_millis;
        self.request_total_failed_duration_millis +=
            previous.request_total_failed_duration_millis;
        self.request_max_duration_millis = self
            .request_max_duration_millis
            .max(previous.request_max_duration_millis);
        self.crawler_runtime_millis += previous.crawler_runtime_millis;
        if self.retry_histogram.len() < previous.retry_histogram.len() {
            self.retry_histogram.resize(previous.retry_histogram.len(), 0);
        }
        for (i, count) in previous.retry_histogram.iter().enumerate() {
            self.retry_histogram[i] += count;
        }
    }
}

/// Final numbers reported when a run completes.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalStatistics {
    pub requests_finished: u64,
    pub requests_failed: u64,
    pub requests_total: u64,
    pub retry_histogram: Vec<u64>,
    /// `None` when no request finished ("never").
    pub request_avg_finished_duration: Option<Duration>,
    /// `None` when no request failed ("never").
    pub request_avg_failed_duration: Option<Duration>,
    pub requests_finished_per_minute: f64,
    pub requests_failed_per_minute: f64,
    pub request_total_duration: Duration,
    pub request_max_duration: Duration,
    pub crawler_runtime: Duration,
}

/// Statistics collector. Mutation is serialized behind one lock; persistence
/// works on a copy-on-read snapshot.
pub struct Statistics {
    state: Mutex<StatisticsState>,
    instance_start: Mutex<Option<Instant>>,
    persist_state_key: String,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        let stats_id = NEXT_STATS_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            state: Mutex::new(StatisticsState {
                stats_id,
                ..StatisticsState::default()
            }),
            instance_start: Mutex::new(None),
            persist_state_key: format!("CRAWLER_STATISTICS_{stats_id}"),
        }
    }

    #[must_use]
    pub fn persist_state_key(&self) -> &str {
        &self.persist_state_key
    }

    /// Mark the start of a run.
    pub fn start(&self) {
        *self.instance_start.lock() = Some(Instant::now());
        self.state.lock().crawler_last_started_at = Some(Utc::now());
    }

    /// Mark the end of a run, folding the elapsed time into the runtime.
    pub fn finish(&self) {
        let elapsed = self.instance_start.lock().take().map(|s| s.elapsed());
        let mut state = self.state.lock();
        state.crawler_finished_at = Some(Utc::now());
        if let Some(elapsed) = elapsed {
            state.crawler_runtime_millis += elapsed.as_millis() as u64;
        }
    }

    /// Record a successfully handled request.
    pub fn record_request_finished(&self, retry_count: u32, duration: Duration) {
        let mut state = self.state.lock();
        state.requests_finished += 1;
        let slot = retry_count as usize;
        if state.retry_histogram.len() <= slot {
            state.retry_histogram.resize(slot + 1, 0);
        }
        state.retry_histogram[slot] += 1;
        state.request_total_finished_duration_millis += duration.as_millis() as u64;
        state.request_max_duration_millis = state
            .request_max_duration_millis
            .max(duration.as_millis() as u64);
    }

    /// Record a permanently failed request.
    pub fn record_request_failed(&self, retry_count: u32, duration: Duration) {
        let mut state = self.state.lock();
        state.requests_failed += 1;
        let slot = retry_count as usize;
        if state.retry_histogram.len() <= slot {
            state.retry_histogram.resize(slot + 1, 0);
        }
        state.retry_histogram[slot] += 1;
        state.request_total_failed_duration_millis += duration.as_millis() as u64;
        state.request_max_duration_millis = state
            .request_max_duration_millis
            .max(duration.as_millis() as u64);
    }

    fn runtime_now(&self, state: &StatisticsState) -> Duration {
        let live = self
            .instance_start
            .lock()
            .map(|start| start.elapsed())
            .unwrap_or(Duration::ZERO);
        Duration::from_millis(state.crawler_runtime_millis) + live
    }

    /// Copy-on-read snapshot of the state, with the runtime brought current.
    #[must_use]
    pub fn snapshot(&self) -> StatisticsState {
        let state = self.state.lock().clone();
        let runtime = self.runtime_now(&state);
        StatisticsState {
            crawler_runtime_millis: runtime.as_millis() as u64,
            ..state
        }
    }

    /// Derive the final numbers for the run so far.
    #[must_use]
    pub fn calculate(&self) -> FinalStatistics {
        let state = self.snapshot();
        let runtime = Duration::from_millis(state.crawler_runtime_millis);
        let total_minutes = runtime.as_secs_f64() / 60.0;

        let avg = |total_millis: u64, count: u64| {
            (count > 0).then(|| Duration::from_millis(total_millis / count))
        };
        let per_minute = |count: u64| {
            if total_minutes > 0.0 {
                count as f64 / total_minutes
            } else {
                0.0
            }
        };

        FinalStatistics {
            requests_finished: state.requests_finished,
            requests_failed: state.requests_failed,
            requests_total: state.requests_finished + state.requests_failed,
            retry_histogram: state.retry_histogram.clone(),
            request_avg_finished_duration: avg(
                state.request_total_finished_duration_millis,
                state.requests_finished,
            ),
            request_avg_failed_duration: avg(
                state.request_total_failed_duration_millis,
                state.requests_failed,
            ),
            requests_finished_per_minute: per_minute(state.requests_finished),
            requests_failed_per_minute: per_minute(state.requests_failed),
            request_total_duration: Duration::from_millis(
                state.request_total_finished_duration_millis
                    + state.request_total_failed_duration_millis,
            ),
            request_max_duration: Duration::from_millis(state.request_max_duration_millis),
            crawler_runtime: runtime,
        }
    }

    /// Persist the current snapshot under this instance's key.
    pub async fn persist(&self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        let snapshot = self.snapshot();
        let value = serde_json::to_value(&snapshot)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        store.set(&self.persist_state_key, value).await
    }

    /// Load a previously persisted state and merge it into the live one.
    pub async fn restore(&self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        let Some(value) = store.get(&self.persist_state_key).await? else {
            return Ok(());
        };
        let previous: StatisticsState = serde_json::from_value(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        debug!(
            "Merging persisted statistics: {} finished, {} failed",
            previous.requests_finished, previous.requests_failed
        );
        self.state.lock().merge_previous(&previous);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    #[test]
    fn histogram_slots_grow_on_demand() {
        let stats = Statistics::new();
        stats.record_request_finished(0, Duration::from_millis(10));
        stats.record_request_finished(2, Duration::from_millis(20));
        let state = stats.snapshot();
        assert_eq!(state.retry_histogram, vec![1, 0, 1]);
        assert_eq!(state.requests_finished, 2);
    }

    #[test]
    fn max_duration_never_decreases() {
        let stats = Statistics::new();
        stats.record_request_finished(0, Duration::from_millis(500));
        stats.record_request_finished(0, Duration::from_millis(100));
        assert_eq!(stats.snapshot().request_max_duration_millis, 500);
    }

    #[test]
    fn averages_are_none_without_samples() {
        let stats = Statistics::new();
        let calculated = stats.calculate();
        assert_eq!(calculated.request_avg_finished_duration, None);
        assert_eq!(calculated.request_avg_failed_duration, None);
        assert_eq!(calculated.requests_total, 0);
    }

    #[test]
    fn calculate_derives_totals() {
        let stats = Statistics::new();
        stats.start();
        stats.record_request_finished(0, Duration::from_millis(100));
        stats.record_request_finished(1, Duration::from_millis(300));
        stats.record_request_failed(2, Duration::from_millis(50));
        stats.finish();

        let calculated = stats.calculate();
        assert_eq!(calculated.requests_finished, 2);
        assert_eq!(calculated.requests_failed, 1);
        assert_eq!(calculated.requests_total, 3);
        assert_eq!(
            calculated.request_avg_finished_duration,
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            calculated.request_total_duration,
            Duration::from_millis(450)
        );
    }

    #[test]
    fn merge_sums_counters_and_takes_max() {
        let mut current = StatisticsState {
            requests_finished: 2,
            requests_failed: 1,
            retry_histogram: vec![2],
            request_total_finished_duration_millis: 100,
            request_total_failed_duration_millis: 10,
            request_max_duration_millis: 80,
            crawler_runtime_millis: 1000,
            ..StatisticsState::default()
        };
        let previous = StatisticsState {
            requests_finished: 3,
            requests_failed: 0,
            retry_histogram: vec![1, 1, 1],
            request_total_finished_duration_millis: 200,
            request_total_failed_duration_millis: 0,
            request_max_duration_millis: 150,
            crawler_runtime_millis: 5000,
            ..StatisticsState::default()
        };
        current.merge_previous(&previous);
        assert_eq!(current.requests_finished, 5);
        assert_eq!(current.retry_histogram, vec![3, 1, 1]);
        assert_eq!(current.request_max_duration_millis, 150);
        assert_eq!(current.crawler_runtime_millis, 6000);
    }

    #[tokio::test]
    async fn persist_reload_persist_is_stable() {
        let store = MemoryKeyValueStore::new();
        let stats = Statistics::new();
        stats.record_request_finished(0, Duration::from_millis(100));
        stats.persist(&store).await.expect("persist");

        let first = store
            .get(stats.persist_state_key())
            .await
            .expect("get")
            .expect("stored");

        let reloaded = Statistics::new();
        // Point the fresh instance at the same document.
        let previous: StatisticsState =
            serde_json::from_value(first.clone()).expect("state parses");
        reloaded.state.lock().merge_previous(&previous);
        let second = serde_json::to_value(StatisticsState {
            stats_id: previous.stats_id,
            ..reloaded.snapshot()
        })
        .expect("state serializes");

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn restore_merges_previous_run() {
        let store = MemoryKeyValueStore::new();
        let stats = Statistics::new();
        stats.record_request_finished(1, Duration::from_millis(100));
        stats.persist(&store).await.expect("persist");

        stats.record_request_finished(0, Duration::from_millis(50));
        stats.restore(&store).await.expect("restore");
        let state = stats.snapshot();
        // One live sample at slot 0, merged sample at slot 1, plus the
        // persisted copy of the first sample.
        assert_eq!(state.requests_finished, 3);
    }

    #[test]
    fn unknown_fields_in_persisted_state_are_ignored() {
        let json = r#"{"statsId":0,"requestsFinished":4,"requestsFailed":0,
            "retryHistogram":[4],"requestTotalFinishedDurationMillis":10,
            "requestTotalFailedDurationMillis":0,"requestMaxDurationMillis":5,
            "crawlerRuntimeMillis":99,"someFutureField":true}"#;
        let state: StatisticsState = serde_json::from_str(json).expect("tolerant parse");
        assert_eq!(state.requests_finished, 4);
    }
}
