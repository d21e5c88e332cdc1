//! Per-domain rate-limit tracking
//!
//! When a target returns HTTP 429, the throttler records the event for that
//! domain and applies exponential backoff (overridden by `Retry-After` when
//! the server provides one). Requests to other domains are unaffected. The
//! driver consults [`RequestThrottler::is_throttled`] before dispatching and
//! reclaims throttled requests with a delay.
//!
//! This also prevents the "death spiral" where 429 responses lower CPU usage
//! and the autoscaled pool reacts by scaling concurrency up.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info};
use url::Url;

/// Initial delay after the first 429 from a domain.
const BASE_DELAY: Duration = Duration::from_secs(2);

/// Cap on the delay between requests to a rate-limited domain.
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct DomainState {
    /// Earliest instant the next request to this domain is allowed.
    next_allowed_at: Instant,
    /// Consecutive 429 responses, drives the exponential backoff.
    consecutive_429_count: u32,
}

/// Per-domain 429 tracker with exponential backoff.
#[derive(Debug, Default)]
pub struct RequestThrottler {
    domain_states: DashMap<String, DomainState>,
}

impl RequestThrottler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn extract_domain(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
    }

    /// Record a 429 for the domain of `url`. `retry_after` takes priority
    /// over the computed exponential backoff; either way the delay is capped.
    pub fn record_rate_limit(&self, url: &str, retry_after: Option<Duration>) {
        let Some(domain) = Self::extract_domain(url) else {
            return;
        };

        let mut state = self.domain_states.entry(domain.clone()).or_insert_with(|| {
            DomainState {
                next_allowed_at: Instant::now(),
                consecutive_429_count: 0,
            }
        });
        state.consecutive_429_count += 1;

        let delay = retry_after.unwrap_or_else(|| {
            // 2s, 4s, 8s, ... for consecutive 429s.
            BASE_DELAY.saturating_mul(1u32 << (state.consecutive_429_count - 1).min(31))
        });
        let delay = delay.min(MAX_DELAY);
        state.next_allowed_at = Instant::now() + delay;

        info!(
            "Rate limit (429) detected for domain \"{domain}\" (consecutive: {}, delay: {:.1}s)",
            state.consecutive_429_count,
            delay.as_secs_f64()
        );
    }

    /// Whether requests to the domain of `url` must still wait.
    #[must_use]
    pub fn is_throttled(&self, url: &str) -> bool {
        let Some(domain) = Self::extract_domain(url) else {
            return false;
        };
        match self.domain_states.get(&domain) {
            Some(state) => Instant::now() < state.next_allowed_at,
            None => false,
        }
    }

    /// Remaining wait before the next request to this domain is allowed.
    /// Zero when no delay is needed.
    #[must_use]
    pub fn get_delay(&self, url: &str) -> Duration {
        let Some(domain) = Self::extract_domain(url) else {
            return Duration::ZERO;
        };
        match self.domain_states.get(&domain) {
            Some(state) => state
                .next_allowed_at
                .saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Record a successful request, resetting the domain's backoff counter.
    pub fn record_success(&self, url: &str) {
        let Some(domain) = Self::extract_domain(url) else {
            return;
        };
        if let Some(mut state) = self.domain_states.get_mut(&domain)
            && state.consecutive_429_count > 0
        {
            debug!("Resetting rate limit state for domain \"{domain}\" after successful request");
            state.consecutive_429_count = 0;
        }
    }

    /// Consecutive 429 count currently tracked for the domain of `url`.
    #[must_use]
    pub fn consecutive_count(&self, url: &str) -> u32 {
        Self::extract_domain(url)
            .and_then(|domain| {
                self.domain_states
                    .get(&domain)
                    .map(|state| state.consecutive_429_count)
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_domain_is_not_throttled() {
        let throttler = RequestThrottler::new();
        assert!(!throttler.is_throttled("http://example.com/a"));
        assert_eq!(throttler.get_delay("http://example.com/a"), Duration::ZERO);
    }

    #[test]
    fn backoff_grows_monotonically_and_caps() {
        let throttler = RequestThrottler::new();
        let url = "http://example.com/a";
        let mut previous = Duration::ZERO;
        for _ in 0..8 {
            throttler.record_rate_limit(url, None);
            let delay = throttler.get_delay(url);
            assert!(delay >= previous, "backoff must be non-decreasing");
            assert!(delay <= MAX_DELAY);
            previous = delay;
        }
        // 2 * 2^7 = 256s, so by now the cap is in effect.
        assert!(previous > MAX_DELAY - Duration::from_secs(1));
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let throttler = RequestThrottler::new();
        let url = "http://example.com/a";
        throttler.record_rate_limit(url, Some(Duration::from_secs(10)));
        let delay = throttler.get_delay(url);
        assert!(delay > Duration::from_secs(9) && delay <= Duration::from_secs(10));
        assert!(throttler.is_throttled(url));
    }

    #[test]
    fn success_resets_consecutive_count() {
        let throttler = RequestThrottler::new();
        let url = "http://example.com/a";
        throttler.record_rate_limit(url, None);
        throttler.record_rate_limit(url, None);
        assert_eq!(throttler.consecutive_count(url), 2);
        throttler.record_success(url);
        assert_eq!(throttler.consecutive_count(url), 0);
    }

    #[test]
    fn domains_are_tracked_independently() {
        let throttler = RequestThrottler::new();
        throttler.record_rate_limit("http://slow.example.com/x", None);
        assert!(throttler.is_throttled("http://slow.example.com/y"));
        assert!(!throttler.is_throttled("http://fast.example.com/x"));
    }

    #[test]
    fn throttling_expires() {
        let throttler = RequestThrottler::new();
        let url = "http://example.com/a";
        throttler.record_rate_limit(url, Some(Duration::from_millis(10)));
        assert!(throttler.is_throttled(url));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!throttler.is_throttled(url));
        assert_eq!(throttler.get_delay(url), Duration::ZERO);
    }
}
