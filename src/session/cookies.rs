//! Per-domain cookie storage for sessions

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single stored cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

impl CookieRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_path(),
            expires: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|expires| expires <= Utc::now())
    }
}

/// Cookie jar keyed by domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieJar {
    by_domain: HashMap<String, Vec<CookieRecord>>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie, replacing any previous cookie with the same
    /// `(name, path)` for its domain.
    pub fn set(&mut self, cookie: CookieRecord) {
        let entries = self.by_domain.entry(cookie.domain.clone()).or_default();
        entries.retain(|existing| !(existing.name == cookie.name && existing.path == cookie.path));
        entries.push(cookie);
    }

    /// Unexpired cookies stored for the exact domain.
    #[must_use]
    pub fn get_for_domain(&self, domain: &str) -> Vec<CookieRecord> {
        self.by_domain
            .get(domain)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|cookie| !cookie.is_expired())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `Cookie` header value for the domain, or `None` when nothing applies.
    #[must_use]
    pub fn header_for_domain(&self, domain: &str) -> Option<String> {
        let cookies = self.get_for_domain(domain);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// All cookies across domains, for persistence.
    #[must_use]
    pub fn all(&self) -> Vec<CookieRecord> {
        self.by_domain.values().flatten().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_domain.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_domain.values().all(Vec::is_empty)
    }
}

impl FromIterator<CookieRecord> for CookieJar {
    fn from_iter<T: IntoIterator<Item = CookieRecord>>(iter: T) -> Self {
        let mut jar = Self::new();
        for cookie in iter {
            jar.set(cookie);
        }
        jar
    }
}
