//! crawlkit: a general-purpose web crawling runtime
//!
//! Register request handlers, enqueue seed URLs, and the runtime drives the
//! crawl to completion: an autoscaled worker pool pulls requests from a
//! deduplicated queue, pairs them with sessions and proxies, pushes them
//! through a middleware pipeline into your handler, and records the outcome,
//! with per-domain throttling, retry/rotation policies and periodic state
//! persistence along the way.
//!
//! Transports, parsers and browsers are collaborators behind traits; the
//! runtime itself never touches the network.
//!
//! ```no_run
//! use crawlkit::{Crawler, CrawlError};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CrawlError> {
//!     let crawler = Crawler::builder()
//!         .request_handler(|context| async move {
//!             context.push_data(json!({ "url": context.request.url }));
//!             context.enqueue_links(["/next-page"]);
//!             Ok(())
//!         })
//!         .build();
//!
//!     let stats = crawler.run(["https://example.com"]).await?;
//!     println!("finished: {}", stats.requests_finished);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crawler;
pub mod errors;
pub mod events;
pub mod http;
pub mod monitor;
pub mod parse;
pub mod pipeline;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod router;
pub mod session;
pub mod stats;
pub mod storage;
pub mod throttle;

pub use config::Configuration;
pub use crawler::{
    Crawler, CrawlerBuilder, CrawlerOptions, ErrorHandler, FailedRequestHandler,
    SkippedRequestHandler,
};
pub use errors::{CrawlError, ErrorKind};
pub use events::{Event, EventManager};
pub use http::{HttpClient, HttpResponse};
pub use monitor::{
    LoadRatioInfo, Snapshotter, SnapshotterOptions, SystemInfo, SystemMonitor,
    SystemMonitorOptions,
};
pub use parse::Parser;
pub use pipeline::{
    Cleanup, ContextPipeline, ContextServices, CrawlingContext, Middleware, RequestHandler,
    StopHandle, handler_fn, noop_cleanup,
};
pub use pool::{AutoscaledPool, AutoscaledPoolOptions, TaskRateLimiter};
pub use proxy::{ProxyConfiguration, ProxyConfigurationError, ProxyInfo};
pub use request::{Headers, Method, Request, RequestBuilder, RequestState, compute_unique_key};
pub use router::Router;
pub use session::{
    CookieJar, CookieRecord, Session, SessionOptions, SessionPool, SessionPoolOptions,
};
pub use stats::{
    ErrorGroup, ErrorTracker, ErrorTrackerOptions, FinalStatistics, Statistics, StatisticsState,
};
pub use storage::{
    AddRequestResult, Dataset, DatasetPage, ExportFormat, FileSystemKeyValueStore, KeyValueStore,
    MemoryDataset, MemoryKeyValueStore, RequestList, RequestLoader, RequestLoaderTandem,
    RequestProvider, RequestQueue, RequestQueueMetadata, RequestQueueOptions, StorageError,
};
pub use throttle::RequestThrottler;
