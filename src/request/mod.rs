//! Request model
//!
//! A [`Request`] is the unit of work flowing through the crawler: it carries
//! the target URL, HTTP method, headers and payload, free-form user data, and
//! the bookkeeping fields the engine uses for retries and session affinity.
//! Identity is the `unique_key`; see [`unique_key::compute_unique_key`].

pub mod unique_key;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use unique_key::{compute_short_hash, compute_unique_key, normalize_url};

/// Key in `user_data` under which the routing label is stored.
pub const LABEL_KEY: &str = "label";

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    /// Uppercase wire representation of the method.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(format!("unknown HTTP method: {other}")),
        }
    }
}

/// Case-insensitive header map with deterministic serialization.
///
/// Keys are folded to lowercase on insert so lookups never depend on the
/// original casing, and the underlying `BTreeMap` keeps serialized output
/// stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_lowercase(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_lowercase())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestState {
    #[default]
    Unprocessed,
    Requested,
    InProgress,
    Handled,
    Failed,
}

/// A single crawl request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Canonical identity of the request, stable across retries.
    pub unique_key: String,
    pub url: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Free-form user data; the routing label lives under `"label"`.
    #[serde(default)]
    pub user_data: serde_json::Map<String, Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub no_retry: bool,
    /// Sticky session binding. When set, the pool must return this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Per-request override of the crawler-wide retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub state: RequestState,
    /// Final URL after redirects, filled in by the transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_url: Option<String>,
    /// Session rotations consumed by this request; does not count as retries.
    #[serde(default)]
    pub session_rotation_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Create a GET request with a computed unique key.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::builder(url).build()
    }

    /// Start building a request with non-default options.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(url)
    }

    /// The routing label, if any.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.user_data.get(LABEL_KEY).and_then(Value::as_str)
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.user_data
            .insert(LABEL_KEY.to_string(), Value::String(label.into()));
    }

    /// Retry budget for this request, honoring the per-request override.
    #[must_use]
    pub fn effective_max_retries(&self, crawler_default: u32) -> u32 {
        self.max_retries.unwrap_or(crawler_default)
    }

    /// Hostname of the request URL, empty when the URL cannot be parsed.
    #[must_use]
    pub fn domain(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

impl From<&str> for Request {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for Request {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    url: String,
    method: Method,
    headers: Headers,
    payload: Option<Vec<u8>>,
    user_data: serde_json::Map<String, Value>,
    unique_key: Option<String>,
    session_id: Option<String>,
    max_retries: Option<u32>,
    no_retry: bool,
    keep_url_fragment: bool,
    use_extended_unique_key: bool,
}

impl RequestBuilder {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Headers::new(),
            payload: None,
            user_data: serde_json::Map::new(),
            unique_key: None,
            session_id: None,
            max_retries: None,
            no_retry: false,
            keep_url_fragment: false,
            use_extended_unique_key: false,
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.user_data
            .insert(LABEL_KEY.to_string(), Value::String(label.into()));
        self
    }

    #[must_use]
    pub fn user_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.user_data.insert(key.into(), value);
        self
    }

    /// Override the computed unique key.
    #[must_use]
    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    #[must_use]
    pub fn keep_url_fragment(mut self, keep: bool) -> Self {
        self.keep_url_fragment = keep;
        self
    }

    /// Mix a short payload hash into the unique key.
    #[must_use]
    pub fn use_extended_unique_key(mut self, extended: bool) -> Self {
        self.use_extended_unique_key = extended;
        self
    }

    #[must_use]
    pub fn build(self) -> Request {
        let unique_key = self.unique_key.unwrap_or_else(|| {
            compute_unique_key(
                &self.url,
                self.method,
                self.payload.as_deref(),
                self.keep_url_fragment,
                self.use_extended_unique_key,
            )
        });

        Request {
            unique_key,
            url: self.url,
            method: self.method,
            headers: self.headers,
            payload: self.payload,
            user_data: self.user_data,
            retry_count: 0,
            no_retry: self.no_retry,
            session_id: self.session_id,
            max_retries: self.max_retries,
            state: RequestState::Unprocessed,
            loaded_url: None,
            session_rotation_count: 0,
            handled_at: None,
        }
    }
}
