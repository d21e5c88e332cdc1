//! Global task-start rate limiter
//!
//! Caps how many worker tasks may start per minute, pool-wide. A sliding
//! window of start timestamps guarantees the cap holds over *any* 60 second
//! window, not just aligned ones.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Window over which the cap applies.
const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter on task starts.
#[derive(Debug)]
pub struct TaskRateLimiter {
    max_per_minute: Option<u32>,
    starts: Mutex<VecDeque<Instant>>,
}

impl TaskRateLimiter {
    /// `None` means unlimited.
    #[must_use]
    pub fn new(max_per_minute: Option<u32>) -> Self {
        Self {
            max_per_minute,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to take a start token. On success the start is recorded; on
    /// failure the caller gets the duration until a token frees up.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let Some(max) = self.max_per_minute else {
            return Ok(());
        };
        let now = Instant::now();
        let mut starts = self.starts.lock();
        while let Some(oldest) = starts.front() {
            if now.duration_since(*oldest) >= WINDOW {
                starts.pop_front();
            } else {
                break;
            }
        }
        if starts.len() < max as usize {
            starts.push_back(now);
            Ok(())
        } else {
            let oldest = starts
                .front()
                .copied()
                .unwrap_or(now);
            Err((oldest + WINDOW).saturating_duration_since(now))
        }
    }

    /// Take a start token, sleeping as long as needed.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait.max(Duration::from_millis(10))).await,
            }
        }
    }

    /// Starts currently inside the window.
    #[must_use]
    pub fn starts_in_window(&self) -> usize {
        let now = Instant::now();
        self.starts
            .lock()
            .iter()
            .filter(|start| now.duration_since(**start) < WINDOW)
            .count()
    }
}
