//! Crawler driver
//!
//! The top-level loop tying everything together: requests come out of the
//! queue (or loader tandem), get a session and a proxy, run through the
//! middleware pipeline into the routed handler, and their outcome feeds the
//! statistics, throttler and retry machinery. Concurrency is driven by the
//! autoscaled pool; persistence and monitoring ride on the event bus.

mod driver;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Configuration;
use crate::errors::CrawlError;
use crate::events::{Event, EventManager};
use crate::http::HttpClient;
use crate::monitor::{Snapshotter, SnapshotterOptions, SystemMonitor, SystemMonitorOptions};
use crate::pipeline::{ContextPipeline, ContextServices, CrawlingContext, Middleware, StopHandle};
use crate::pool::{AutoscaledPool, AutoscaledPoolOptions, PredicateFn, RunTaskFn};
use crate::proxy::ProxyConfiguration;
use crate::request::Request;
use crate::router::Router;
use crate::session::{SessionPool, SessionPoolOptions};
use crate::stats::{ErrorTracker, FinalStatistics, Statistics};
use crate::storage::{
    AddRequestResult, Dataset, DatasetPage, ExportFormat, KeyValueStore, MemoryDataset,
    MemoryKeyValueStore, RequestLoader, RequestLoaderTandem, RequestProvider, RequestQueue,
    RequestQueueOptions,
};
use crate::throttle::RequestThrottler;

/// Callback invoked before a retry; may return a mutated request to retry
/// with (e.g. rewritten headers after a token refresh).
pub type ErrorHandler = Arc<
    dyn for<'a> Fn(Request, &'a CrawlError) -> BoxFuture<'a, anyhow::Result<Request>>
        + Send
        + Sync,
>;

/// Callback invoked once after the retry budget is exhausted.
pub type FailedRequestHandler =
    Arc<dyn for<'a> Fn(&'a Request, &'a CrawlError) -> BoxFuture<'a, ()> + Send + Sync>;

/// Callback invoked when a request is skipped by a pipeline interrupt.
pub type SkippedRequestHandler =
    Arc<dyn for<'a> Fn(&'a Request, &'a str) -> BoxFuture<'a, ()> + Send + Sync>;

/// Driver-level tuning knobs.
#[derive(Debug, Clone)]
pub struct CrawlerOptions {
    /// Crawler-wide retry budget (overridable per request).
    pub max_request_retries: u32,
    /// Session rotations allowed per request; rotations don't consume retries.
    pub max_session_rotations: u32,
    /// Hard cap on finished+failed requests; reaching it stops the crawl.
    pub max_requests_per_crawl: Option<u64>,
    pub request_handler_timeout: Duration,
    /// Keep workers waiting on an empty queue for externally added requests.
    pub keep_alive: bool,
    pub use_session_pool: bool,
    /// Statuses treated as errors on top of the 4xx/5xx default.
    pub additional_error_status_codes: Vec<u16>,
    /// Statuses never treated as errors.
    pub ignore_error_status_codes: Vec<u16>,
    pub autoscaling: AutoscaledPoolOptions,
    pub session_pool: SessionPoolOptions,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            max_request_retries: 3,
            max_session_rotations: 10,
            max_requests_per_crawl: None,
            request_handler_timeout: Duration::from_secs(60),
            keep_alive: false,
            use_session_pool: true,
            additional_error_status_codes: Vec::new(),
            ignore_error_status_codes: Vec::new(),
            autoscaling: AutoscaledPoolOptions::default(),
            session_pool: SessionPoolOptions::default(),
        }
    }
}

impl CrawlerOptions {
    /// Map a response status to an error per the configured status sets.
    /// `None` means the status is acceptable.
    #[must_use]
    pub fn classify_status(
        &self,
        status: u16,
        retry_after: Option<Duration>,
    ) -> Option<CrawlError> {
        if self.ignore_error_status_codes.contains(&status) {
            return None;
        }
        if status >= 400 || self.additional_error_status_codes.contains(&status) {
            return Some(CrawlError::from_status(status, retry_after));
        }
        None
    }
}

pub(crate) struct CrawlerInner {
    pub(crate) options: CrawlerOptions,
    pub(crate) config: Configuration,
    pub(crate) router: Arc<Router>,
    pub(crate) pipeline: ContextPipeline,
    pub(crate) provider: Arc<dyn RequestProvider>,
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) session_pool: Option<Arc<SessionPool>>,
    pub(crate) proxy_config: Option<Arc<ProxyConfiguration>>,
    pub(crate) throttler: Arc<RequestThrottler>,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) error_tracker: Arc<ErrorTracker>,
    pub(crate) services: Arc<ContextServices>,
    pub(crate) monitor: Arc<SystemMonitor>,
    pub(crate) events: Arc<EventManager>,
    pub(crate) pool: AutoscaledPool,
    pub(crate) stop: StopHandle,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) failed_request_handler: Option<FailedRequestHandler>,
    pub(crate) on_skipped_request: Option<SkippedRequestHandler>,
    /// Tracks repeated identical pipeline failures per request, so
    /// deterministic middleware bugs fail fast instead of burning retries.
    pub(crate) pipeline_failures: DashMap<String, (String, u32)>,
    pub(crate) fatal: Mutex<Option<CrawlError>>,
    pub(crate) running: AtomicBool,
}

/// The crawling runtime. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Crawler {
    inner: Arc<CrawlerInner>,
}

impl Crawler {
    #[must_use]
    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder::new()
    }

    /// Enqueue requests; duplicates (by unique key) are no-ops.
    pub async fn add_requests(
        &self,
        requests: impl IntoIterator<Item = impl Into<Request>>,
    ) -> Result<Vec<AddRequestResult>, CrawlError> {
        let requests: Vec<Request> = requests.into_iter().map(Into::into).collect();
        Ok(self.inner.provider.add_requests(requests, false).await?)
    }

    /// Request a graceful stop: no new fetches, in-flight work finishes.
    pub fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!("Crawler stopping: {reason}");
        self.inner.stop.stop(reason);
        // A keep-alive queue only finishes once explicitly closed.
        self.inner.queue.close();
    }

    /// Best-effort cancellation of in-flight work.
    pub fn abort(&self) {
        warn!("Crawler aborting");
        self.inner.stop.stop("aborted");
        self.inner.pool.abort();
    }

    /// Final statistics for the run so far.
    #[must_use]
    pub fn statistics(&self) -> FinalStatistics {
        self.inner.stats.calculate()
    }

    #[must_use]
    pub fn error_tracker(&self) -> &Arc<ErrorTracker> {
        &self.inner.error_tracker
    }

    #[must_use]
    pub fn dataset(&self) -> Arc<dyn Dataset> {
        Arc::clone(&self.inner.services.dataset)
    }

    pub async fn get_data(
        &self,
        offset: usize,
        limit: usize,
        desc: bool,
    ) -> Result<DatasetPage, CrawlError> {
        Ok(self
            .inner
            .services
            .dataset
            .get_data(offset, limit, desc)
            .await?)
    }

    pub async fn export_data(&self, format: ExportFormat) -> Result<String, CrawlError> {
        Ok(self.inner.services.dataset.export(format).await?)
    }

    /// Run the crawl to completion over the given seeds.
    pub async fn run(
        &self,
        seeds: impl IntoIterator<Item = impl Into<Request>>,
    ) -> Result<FinalStatistics, CrawlError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(CrawlError::ServiceConflict(
                "this crawler is already running".to_string(),
            ));
        }
        let result = self.run_inner(seeds).await;
        self.inner.running.store(false, Ordering::Release);
        result
    }

    async fn run_inner(
        &self,
        seeds: impl IntoIterator<Item = impl Into<Request>>,
    ) -> Result<FinalStatistics, CrawlError> {
        let inner = &self.inner;
        let seeds: Vec<Request> = seeds.into_iter().map(Into::into).collect();
        if !seeds.is_empty() {
            inner.provider.add_requests(seeds, false).await?;
        }

        self.prepare_persisted_state().await?;

        inner.stats.start();
        inner.monitor.start();
        inner.events.start_recurring(
            inner.config.persist_state_interval,
            || Event::PersistState {
                is_migrating: false,
            },
        );
        let persistence_task = self.spawn_persistence_listener();

        let run_task: RunTaskFn = {
            let inner = Arc::clone(inner);
            Arc::new(move || {
                let inner = Arc::clone(&inner);
                Box::pin(driver::process_one(inner))
            })
        };
        let is_task_ready: PredicateFn = {
            let inner = Arc::clone(inner);
            Arc::new(move || {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    !inner.stop.is_stopped() && !inner.provider.is_empty().await
                })
            })
        };
        let is_finished: PredicateFn = {
            let inner = Arc::clone(inner);
            Arc::new(move || {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    inner.stop.is_stopped() || inner.provider.is_finished().await
                })
            })
        };

        inner.pool.run(run_task, is_task_ready, is_finished).await;

        inner.monitor.stop();
        inner.stats.finish();
        if inner.config.persist_storage {
            self.persist_state().await;
        }
        inner.events.close();
        if let Some(task) = persistence_task {
            let _ = task.await;
        }

        if let Some(fatal) = inner.fatal.lock().take() {
            return Err(fatal);
        }
        let final_stats = inner.stats.calculate();
        info!(
            "Crawl finished: {} succeeded, {} failed",
            final_stats.requests_finished, final_stats.requests_failed
        );
        Ok(final_stats)
    }

    async fn prepare_persisted_state(&self) -> Result<(), CrawlError> {
        let inner = &self.inner;
        let store = &inner.services.key_value_store;
        if inner.config.purge_on_start {
            store.delete(inner.stats.persist_state_key()).await?;
            if let Some(pool) = &inner.session_pool {
                store.delete(&pool.options().persist_state_key).await?;
            }
        } else if inner.config.persist_storage {
            inner.stats.restore(store.as_ref()).await?;
            if let Some(pool) = &inner.session_pool {
                pool.restore(store.as_ref()).await?;
            }
        }
        Ok(())
    }

    async fn persist_state(&self) {
        let inner = &self.inner;
        let store = &inner.services.key_value_store;
        if let Err(e) = inner.stats.persist(store.as_ref()).await {
            error!("Persisting statistics failed: {e}");
        }
        if let Some(pool) = &inner.session_pool
            && let Err(e) = pool.persist(store.as_ref()).await
        {
            error!("Persisting session pool failed: {e}");
        }
    }

    fn spawn_persistence_listener(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.inner.config.persist_storage {
            return None;
        }
        let crawler = self.clone();
        let mut receiver = self.inner.events.subscribe();
        Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(Event::PersistState { .. }) => crawler.persist_state().await,
                    Ok(Event::Exit) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        }))
    }
}

/// Builder for [`Crawler`].
pub struct CrawlerBuilder {
    options: CrawlerOptions,
    config: Configuration,
    router: Router,
    middlewares: Vec<Arc<dyn Middleware>>,
    request_queue: Option<Arc<RequestQueue>>,
    request_loader: Option<Arc<dyn RequestLoader>>,
    proxy_config: Option<Arc<ProxyConfiguration>>,
    http_client: Option<Arc<dyn HttpClient>>,
    dataset: Option<Arc<dyn Dataset>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    error_handler: Option<ErrorHandler>,
    failed_request_handler: Option<FailedRequestHandler>,
    on_skipped_request: Option<SkippedRequestHandler>,
    monitor_options: SystemMonitorOptions,
    snapshotter_options: SnapshotterOptions,
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: CrawlerOptions::default(),
            config: Configuration::default(),
            router: Router::new(),
            middlewares: Vec::new(),
            request_queue: None,
            request_loader: None,
            proxy_config: None,
            http_client: None,
            dataset: None,
            key_value_store: None,
            error_handler: None,
            failed_request_handler: None,
            on_skipped_request: None,
            monitor_options: SystemMonitorOptions::default(),
            snapshotter_options: SnapshotterOptions::default(),
        }
    }

    #[must_use]
    pub fn options(mut self, options: CrawlerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn configuration(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    /// Register the default request handler.
    #[must_use]
    pub fn request_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CrawlingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.router.set_default_handler(f);
        self
    }

    /// Register a handler for one routing label.
    #[must_use]
    pub fn labeled_handler<F, Fut>(mut self, label: impl Into<String>, f: F) -> Self
    where
        F: Fn(CrawlingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        self.router.add_handler(label, f);
        self
    }

    /// Replace the router wholesale.
    #[must_use]
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Append a middleware to the context pipeline.
    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    #[must_use]
    pub fn request_queue(mut self, queue: Arc<RequestQueue>) -> Self {
        self.request_queue = Some(queue);
        self
    }

    /// Stream requests from a loader through the queue (tandem mode).
    #[must_use]
    pub fn request_loader(mut self, loader: Arc<dyn RequestLoader>) -> Self {
        self.request_loader = Some(loader);
        self
    }

    #[must_use]
    pub fn proxy_configuration(mut self, proxies: Arc<ProxyConfiguration>) -> Self {
        self.proxy_config = Some(proxies);
        self
    }

    #[must_use]
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    #[must_use]
    pub fn dataset(mut self, dataset: Arc<dyn Dataset>) -> Self {
        self.dataset = Some(dataset);
        self
    }

    #[must_use]
    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value_store = Some(store);
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn failed_request_handler(mut self, handler: FailedRequestHandler) -> Self {
        self.failed_request_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn on_skipped_request(mut self, handler: SkippedRequestHandler) -> Self {
        self.on_skipped_request = Some(handler);
        self
    }

    #[must_use]
    pub fn monitor_options(mut self, options: SystemMonitorOptions) -> Self {
        self.monitor_options = options;
        self
    }

    #[must_use]
    pub fn snapshotter_options(mut self, options: SnapshotterOptions) -> Self {
        self.snapshotter_options = options;
        self
    }

    #[must_use]
    pub fn build(self) -> Crawler {
        let snapshotter = Arc::new(Snapshotter::new(self.snapshotter_options));
        let events = Arc::new(EventManager::default());
        let monitor = Arc::new(SystemMonitor::new(
            Arc::clone(&snapshotter),
            Arc::clone(&events),
            SystemMonitorOptions {
                interval: self.config.system_info_interval,
                ..self.monitor_options
            },
        ));

        let queue = self.request_queue.unwrap_or_else(|| {
            Arc::new(RequestQueue::new(RequestQueueOptions {
                keep_alive: self.options.keep_alive,
                ..RequestQueueOptions::default()
            }))
        });
        let provider: Arc<dyn RequestProvider> = match self.request_loader {
            Some(loader) => Arc::new(RequestLoaderTandem::new(loader, Arc::clone(&queue))),
            None => Arc::clone(&queue) as Arc<dyn RequestProvider>,
        };

        let session_pool = self.options.use_session_pool.then(|| {
            Arc::new(
                SessionPool::new(self.options.session_pool.clone())
                    .with_events(Arc::clone(&events)),
            )
        });

        let stop = StopHandle::new();
        let services = Arc::new(ContextServices {
            dataset: self
                .dataset
                .unwrap_or_else(|| Arc::new(MemoryDataset::new())),
            key_value_store: self
                .key_value_store
                .unwrap_or_else(|| Arc::new(MemoryKeyValueStore::new())),
            http_client: self.http_client,
            snapshotter: Arc::clone(&snapshotter),
            stop: stop.clone(),
        });

        let mut pipeline = ContextPipeline::new();
        for middleware in self.middlewares {
            pipeline = pipeline.compose(middleware);
        }

        let pool = AutoscaledPool::new(self.options.autoscaling.clone(), Arc::clone(&snapshotter));

        Crawler {
            inner: Arc::new(CrawlerInner {
                options: self.options,
                config: self.config,
                router: Arc::new(self.router),
                pipeline,
                provider,
                queue,
                session_pool,
                proxy_config: self.proxy_config,
                throttler: Arc::new(RequestThrottler::new()),
                stats: Arc::new(Statistics::new()),
                error_tracker: Arc::new(ErrorTracker::default()),
                services,
                monitor,
                events,
                pool,
                stop,
                error_handler: self.error_handler,
                failed_request_handler: self.failed_request_handler,
                on_skipped_request: self.on_skipped_request,
                pipeline_failures: DashMap::new(),
                fatal: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }
}

impl Crawler {
    /// Convenience: push one record straight into the dataset (outside any
    /// handler). Handlers should use the context's `push_data` instead.
    pub async fn push_data(&self, item: Value) -> Result<(), CrawlError> {
        Ok(self.inner.services.dataset.push_data(vec![item]).await?)
    }
}
