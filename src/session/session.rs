//! A single crawling session
//!
//! A session bundles cookies, an error score and a usage budget. Sessions are
//! owned by the pool and referenced elsewhere by id; shared mutation goes
//! through interior mutability so the driver can mark outcomes on an
//! `Arc<Session>` without touching the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::cookies::{CookieJar, CookieRecord};

/// Defaults for newly minted sessions.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_age: Duration,
    pub max_usage_count: u64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    pub blocked_status_codes: Vec<u16>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(50 * 60),
            max_usage_count: 50,
            max_error_score: 3.0,
            error_score_decrement: 0.5,
            blocked_status_codes: vec![401, 403, 429],
        }
    }
}

/// A session with cookies, error score and usage tracking.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    max_age: Duration,
    max_usage_count: u64,
    max_error_score: f64,
    error_score_decrement: f64,
    blocked_status_codes: Vec<u16>,
    usage_count: AtomicU64,
    error_score: Mutex<f64>,
    user_data: Mutex<serde_json::Map<String, Value>>,
    cookies: Mutex<CookieJar>,
}

impl Session {
    #[must_use]
    pub fn new(options: &SessionOptions) -> Self {
        Self::with_id(format!("session_{}", Uuid::new_v4().simple()), options)
    }

    #[must_use]
    pub fn with_id(id: String, options: &SessionOptions) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            max_age: options.max_age,
            max_usage_count: options.max_usage_count,
            max_error_score: options.max_error_score,
            error_score_decrement: options.error_score_decrement,
            blocked_status_codes: options.blocked_status_codes.clone(),
            usage_count: AtomicU64::new(0),
            error_score: Mutex::new(0.0),
            user_data: Mutex::new(serde_json::Map::new()),
            cookies: Mutex::new(CookieJar::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn error_score(&self) -> f64 {
        *self.error_score.lock()
    }

    #[must_use]
    pub fn blocked_status_codes(&self) -> &[u16] {
        &self.blocked_status_codes
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age.to_std().is_ok_and(|age| age >= self.max_age)
    }

    #[must_use]
    pub fn is_max_usage_reached(&self) -> bool {
        self.usage_count() >= self.max_usage_count
    }

    /// Blocked means the error score hit its ceiling.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.error_score() >= self.max_error_score
    }

    /// Usable iff not expired, not blocked and under the usage cap.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.is_expired() && !self.is_blocked() && !self.is_max_usage_reached()
    }

    /// Record a successful use: decrement the error score (floor 0) and
    /// consume one usage slot.
    pub fn mark_good(&self) {
        let mut score = self.error_score.lock();
        if *score > 0.0 {
            *score = (*score - self.error_score_decrement).max(0.0);
        }
        drop(score);
        self.usage_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed use: bump the error score and consume a usage slot.
    pub fn mark_bad(&self) {
        *self.error_score.lock() += 1.0;
        self.usage_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Retire the session immediately by jumping the error score to its max.
    pub fn retire(&self) {
        *self.error_score.lock() = self.max_error_score;
    }

    /// Whether `status` is evidence this session is blocked.
    #[must_use]
    pub fn is_blocked_status_code(&self, status: u16) -> bool {
        self.blocked_status_codes.contains(&status)
    }

    pub fn set_cookie(&self, cookie: CookieRecord) {
        self.cookies.lock().set(cookie);
    }

    #[must_use]
    pub fn cookies_for_domain(&self, domain: &str) -> Vec<CookieRecord> {
        self.cookies.lock().get_for_domain(domain)
    }

    #[must_use]
    pub fn cookie_header_for_domain(&self, domain: &str) -> Option<String> {
        self.cookies.lock().header_for_domain(domain)
    }

    pub fn set_user_data(&self, key: impl Into<String>, value: Value) {
        self.user_data.lock().insert(key.into(), value);
    }

    #[must_use]
    pub fn get_user_data(&self, key: &str) -> Option<Value> {
        self.user_data.lock().get(key).cloned()
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn to_model(&self) -> SessionModel {
        SessionModel {
            id: self.id.clone(),
            created_at: self.created_at,
            max_age_secs: self.max_age.as_secs(),
            usage_count: self.usage_count(),
            max_usage_count: self.max_usage_count,
            error_score: self.error_score(),
            max_error_score: self.max_error_score,
            error_score_decrement: self.error_score_decrement,
            blocked_status_codes: self.blocked_status_codes.clone(),
            user_data: self.user_data.lock().clone(),
            cookies: self.cookies.lock().all(),
        }
    }

    /// Rebuild a session from a persisted snapshot.
    #[must_use]
    pub fn from_model(model: SessionModel) -> Self {
        Self {
            id: model.id,
            created_at: model.created_at,
            max_age: Duration::from_secs(model.max_age_secs),
            max_usage_count: model.max_usage_count,
            max_error_score: model.max_error_score,
            error_score_decrement: model.error_score_decrement,
            blocked_status_codes: model.blocked_status_codes,
            usage_count: AtomicU64::new(model.usage_count),
            error_score: Mutex::new(model.error_score),
            user_data: Mutex::new(model.user_data),
            cookies: Mutex::new(model.cookies.into_iter().collect()),
        }
    }
}

/// Persisted form of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModel {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub max_age_secs: u64,
    pub usage_count: u64,
    pub max_usage_count: u64,
    pub error_score: f64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    #[serde(default)]
    pub blocked_status_codes: Vec<u16>,
    #[serde(default)]
    pub user_data: serde_json::Map<String, Value>,
    #[serde(default)]
    pub cookies: Vec<CookieRecord>,
}
