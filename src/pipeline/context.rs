//! Per-request crawling context
//!
//! The context is the capability bundle a handler works with: the request,
//! the acquired session and proxy, plus callbacks for producing data,
//! enqueueing follow-up requests and reaching shared services.
//!
//! `push_data` and `add_requests` are *staged*: they buffer inside the
//! context and the driver commits them only after the handler returns
//! cleanly. A failing handler therefore leaves no side effects behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::errors::CrawlError;
use crate::http::{HttpClient, HttpResponse};
use crate::monitor::{Snapshotter, SystemInfo};
use crate::proxy::ProxyInfo;
use crate::request::Request;
use crate::session::Session;
use crate::storage::{Dataset, KeyValueStore, StorageError};

/// Key prefix for named handler state blobs in the key-value store.
const STATE_KEY_PREFIX: &str = "CRAWLER_STATE";

#[derive(Debug, Default)]
struct StopInner {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Handle for requesting a graceful stop of the crawl.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

impl StopHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!("Stop requested: {reason}");
        *self.inner.reason.lock() = Some(reason);
        self.inner.requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }
}

/// Shared services the context exposes to handlers.
pub struct ContextServices {
    pub dataset: Arc<dyn Dataset>,
    pub key_value_store: Arc<dyn KeyValueStore>,
    pub http_client: Option<Arc<dyn HttpClient>>,
    pub snapshotter: Arc<Snapshotter>,
    pub stop: StopHandle,
}

#[derive(Debug, Default)]
struct StagedEffects {
    data: Mutex<Vec<Value>>,
    requests: Mutex<Vec<Request>>,
}

/// Per-request mutable context passed through middlewares to the handler.
#[derive(Clone)]
pub struct CrawlingContext {
    pub request: Request,
    pub session: Option<Arc<Session>>,
    pub proxy_info: Option<ProxyInfo>,
    services: Arc<ContextServices>,
    staged: Arc<StagedEffects>,
}

impl CrawlingContext {
    #[must_use]
    pub fn new(request: Request, services: Arc<ContextServices>) -> Self {
        Self {
            request,
            session: None,
            proxy_info: None,
            services,
            staged: Arc::new(StagedEffects::default()),
        }
    }

    /// Stage a single record for the dataset.
    pub fn push_data(&self, item: Value) {
        self.staged.data.lock().push(item);
    }

    /// Stage a batch of records for the dataset.
    pub fn push_data_many(&self, items: impl IntoIterator<Item = Value>) {
        self.staged.data.lock().extend(items);
    }

    /// Stage follow-up requests for the queue.
    pub fn add_requests(&self, requests: impl IntoIterator<Item = Request>) {
        self.staged.requests.lock().extend(requests);
    }

    /// Stage follow-up requests from raw URLs, resolving relative ones
    /// against the loaded URL. Returns how many were staged; unparsable
    /// entries are skipped.
    pub fn enqueue_links<S: AsRef<str>>(&self, urls: impl IntoIterator<Item = S>) -> usize {
        let base = self
            .request
            .loaded_url
            .as_deref()
            .unwrap_or(&self.request.url);
        let base = Url::parse(base).ok();

        let mut staged = 0;
        let mut requests = self.staged.requests.lock();
        for raw in urls {
            let raw = raw.as_ref();
            let resolved = match (Url::parse(raw), &base) {
                (Ok(absolute), _) => Some(absolute),
                (Err(_), Some(base)) => base.join(raw).ok(),
                (Err(_), None) => None,
            };
            if let Some(resolved) = resolved {
                requests.push(Request::new(resolved.as_str()));
                staged += 1;
            } else {
                debug!("Skipping unresolvable link: {raw}");
            }
        }
        staged
    }

    /// Send a one-off request through the configured transport.
    pub async fn send_request(&self, request: &Request) -> Result<HttpResponse, CrawlError> {
        match &self.services.http_client {
            Some(client) => {
                client
                    .send(request, self.session.as_ref(), self.proxy_info.as_ref())
                    .await
            }
            None => Err(CrawlError::transport("no HTTP transport configured")),
        }
    }

    #[must_use]
    pub fn get_key_value_store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.services.key_value_store)
    }

    /// Read named state, initializing it with `default` on first use.
    pub async fn use_state(&self, name: &str, default: Value) -> Result<Value, StorageError> {
        let key = format!("{STATE_KEY_PREFIX}_{name}");
        let store = &self.services.key_value_store;
        if let Some(existing) = store.get(&key).await? {
            return Ok(existing);
        }
        store.set(&key, default.clone()).await?;
        Ok(default)
    }

    /// Overwrite named state.
    pub async fn update_state(&self, name: &str, value: Value) -> Result<(), StorageError> {
        let key = format!("{STATE_KEY_PREFIX}_{name}");
        self.services.key_value_store.set(&key, value).await
    }

    /// Latest aggregated system status.
    #[must_use]
    pub fn get_snapshot(&self) -> SystemInfo {
        self.services.snapshotter.get_system_info()
    }

    /// Request a graceful stop of the whole crawl.
    pub fn stop(&self, reason: impl Into<String>) {
        self.services.stop.stop(reason);
    }

    /// Drain staged side effects for commit. Used by the driver after the
    /// handler returns cleanly.
    #[must_use]
    pub(crate) fn take_staged(&self) -> (Vec<Value>, Vec<Request>) {
        let data = std::mem::take(&mut *self.staged.data.lock());
        let requests = std::mem::take(&mut *self.staged.requests.lock());
        (data, requests)
    }
}
