//! Context pipeline
//!
//! An ordered middleware chain wraps the user handler. Each middleware is a
//! two-phase operation: setup enriches the context and returns a cleanup;
//! cleanups run in reverse order of setup, exactly once, regardless of which
//! stage failed, and get to observe the failure (if any) on the way out.

pub mod context;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::warn;

use crate::errors::CrawlError;

pub use context::{ContextServices, CrawlingContext, StopHandle};

/// Future returned by a cleanup phase.
pub type CleanupFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Cleanup half of a middleware. Receives the failure that is propagating,
/// if any; runs exactly once.
pub type Cleanup = Box<dyn FnOnce(Option<&CrawlError>) -> CleanupFuture + Send>;

/// The user request handler.
pub type RequestHandler =
    Arc<dyn Fn(CrawlingContext) -> BoxFuture<'static, Result<(), CrawlError>> + Send + Sync>;

/// Build a [`RequestHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(CrawlingContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
{
    Arc::new(move |context| Box::pin(f(context)))
}

/// A two-phase middleware.
///
/// Setup may mutate the context (attach a session, rewrite headers, fetch the
/// page) and returns the cleanup to run on the way out. Returning
/// [`CrawlError::PipelineInterrupted`] from setup skips the handler without
/// marking the request failed.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn setup(&self, context: &mut CrawlingContext) -> Result<Cleanup, CrawlError>;
}

/// A cleanup that does nothing, for middlewares with no teardown.
#[must_use]
pub fn noop_cleanup() -> Cleanup {
    Box::new(|_failure| Box::pin(async { Ok(()) }))
}

/// Ordered middleware chain around the user handler.
#[derive(Default)]
pub struct ContextPipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl ContextPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it runs after everything added before it.
    #[must_use]
    pub fn compose(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run setups in order, the handler (under `handler_timeout`), then
    /// cleanups in reverse. The first failure wins; cleanups always run.
    pub async fn run(
        &self,
        mut context: CrawlingContext,
        handler: RequestHandler,
        handler_timeout: Duration,
    ) -> Result<(), CrawlError> {
        let mut cleanups: Vec<Cleanup> = Vec::with_capacity(self.middlewares.len());
        let mut failure: Option<CrawlError> = None;

        for middleware in &self.middlewares {
            match middleware.setup(&mut context).await {
                Ok(cleanup) => cleanups.push(cleanup),
                Err(interrupt @ CrawlError::PipelineInterrupted { .. }) => {
                    failure = Some(interrupt);
                    break;
                }
                Err(origin) => {
                    failure = Some(CrawlError::PipelineInitialization {
                        source: Box::new(origin),
                    });
                    break;
                }
            }
        }

        if failure.is_none() {
            let handler_future = handler(context);
            failure = match tokio::time::timeout(handler_timeout, handler_future).await {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(_) => Some(CrawlError::HandlerTimeout {
                    timeout: handler_timeout,
                }),
            };
        }

        for cleanup in cleanups.into_iter().rev() {
            if let Err(cleanup_error) = cleanup(failure.as_ref()).await {
                if failure.is_none() {
                    failure = Some(CrawlError::PipelineFinalization {
                        source: Box::new(CrawlError::handler(cleanup_error)),
                    });
                } else {
                    // The original failure stays primary.
                    warn!("Middleware cleanup failed while unwinding: {cleanup_error}");
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Snapshotter;
    use crate::request::Request;
    use crate::storage::{MemoryDataset, MemoryKeyValueStore};
    use parking_lot::Mutex;

    fn context() -> CrawlingContext {
        let services = Arc::new(ContextServices {
            dataset: Arc::new(MemoryDataset::new()),
            key_value_store: Arc::new(MemoryKeyValueStore::new()),
            http_client: None,
            snapshotter: Arc::new(Snapshotter::default()),
            stop: StopHandle::new(),
        });
        CrawlingContext::new(Request::new("http://h/a"), services)
    }

    /// Middleware that records its setup and cleanup into a shared trace.
    struct Tracing {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
        fail_setup: bool,
    }

    #[async_trait]
    impl Middleware for Tracing {
        async fn setup(&self, _context: &mut CrawlingContext) -> Result<Cleanup, CrawlError> {
            self.trace.lock().push(format!("setup:{}", self.name));
            if self.fail_setup {
                return Err(CrawlError::transport("setup exploded"));
            }
            let trace = Arc::clone(&self.trace);
            let name = self.name;
            Ok(Box::new(move |failure| {
                let saw_failure = failure.is_some();
                Box::pin(async move {
                    trace
                        .lock()
                        .push(format!("cleanup:{name}:{saw_failure}"));
                    Ok(())
                })
            }))
        }
    }

    fn tracing(
        name: &'static str,
        trace: &Arc<Mutex<Vec<String>>>,
        fail_setup: bool,
    ) -> Arc<dyn Middleware> {
        Arc::new(Tracing {
            name,
            trace: Arc::clone(trace),
            fail_setup,
        })
    }

    #[tokio::test]
    async fn cleanups_unwind_in_reverse_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ContextPipeline::new()
            .compose(tracing("m1", &trace, false))
            .compose(tracing("m2", &trace, false))
            .compose(tracing("m3", &trace, false));

        pipeline
            .run(context(), handler_fn(|_cx| async { Ok(()) }), Duration::from_secs(5))
            .await
            .expect("pipeline succeeds");

        assert_eq!(
            *trace.lock(),
            vec![
                "setup:m1",
                "setup:m2",
                "setup:m3",
                "cleanup:m3:false",
                "cleanup:m2:false",
                "cleanup:m1:false",
            ]
        );
    }

    #[tokio::test]
    async fn setup_failure_wraps_and_unwinds_earlier_middlewares() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ContextPipeline::new()
            .compose(tracing("m1", &trace, false))
            .compose(tracing("m2", &trace, true))
            .compose(tracing("m3", &trace, false));

        let error = pipeline
            .run(context(), handler_fn(|_cx| async { Ok(()) }), Duration::from_secs(5))
            .await
            .expect_err("setup failure propagates");

        assert!(matches!(error, CrawlError::PipelineInitialization { .. }));
        // m3 never ran; m1's cleanup observed the failure.
        assert_eq!(
            *trace.lock(),
            vec!["setup:m1", "setup:m2", "cleanup:m1:true"]
        );
    }

    #[tokio::test]
    async fn handler_failure_still_runs_all_cleanups() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ContextPipeline::new()
            .compose(tracing("m1", &trace, false))
            .compose(tracing("m2", &trace, false));

        let error = pipeline
            .run(
                context(),
                handler_fn(|_cx| async { Err(CrawlError::handler(anyhow::anyhow!("boom"))) }),
                Duration::from_secs(5),
            )
            .await
            .expect_err("handler failure propagates");

        assert!(matches!(error, CrawlError::Handler { .. }));
        assert_eq!(
            *trace.lock(),
            vec![
                "setup:m1",
                "setup:m2",
                "cleanup:m2:true",
                "cleanup:m1:true"
            ]
        );
    }

    #[tokio::test]
    async fn interrupt_skips_handler_without_wrapping() {
        struct Interrupting;

        #[async_trait]
        impl Middleware for Interrupting {
            async fn setup(
                &self,
                _context: &mut CrawlingContext,
            ) -> Result<Cleanup, CrawlError> {
                Err(CrawlError::PipelineInterrupted {
                    reason: "robots.txt disallowed".to_string(),
                })
            }
        }

        let ran = Arc::new(Mutex::new(false));
        let ran_clone = Arc::clone(&ran);
        let pipeline = ContextPipeline::new().compose(Arc::new(Interrupting));
        let error = pipeline
            .run(
                context(),
                handler_fn(move |_cx| {
                    let ran = Arc::clone(&ran_clone);
                    async move {
                        *ran.lock() = true;
                        Ok(())
                    }
                }),
                Duration::from_secs(5),
            )
            .await
            .expect_err("interrupt propagates");

        assert!(matches!(error, CrawlError::PipelineInterrupted { .. }));
        assert!(!*ran.lock(), "handler must not run after an interrupt");
    }

    #[tokio::test]
    async fn handler_timeout_is_enforced_and_cleanups_run() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ContextPipeline::new().compose(tracing("m1", &trace, false));

        let error = pipeline
            .run(
                context(),
                handler_fn(|_cx| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }),
                Duration::from_millis(20),
            )
            .await
            .expect_err("timeout propagates");

        assert!(matches!(error, CrawlError::HandlerTimeout { .. }));
        assert_eq!(*trace.lock(), vec!["setup:m1", "cleanup:m1:true"]);
    }

    #[tokio::test]
    async fn cleanup_failure_surfaces_as_finalization_error() {
        struct FailingCleanup;

        #[async_trait]
        impl Middleware for FailingCleanup {
            async fn setup(
                &self,
                _context: &mut CrawlingContext,
            ) -> Result<Cleanup, CrawlError> {
                Ok(Box::new(|_failure| {
                    Box::pin(async { Err(anyhow::anyhow!("teardown exploded")) })
                }))
            }
        }

        let pipeline = ContextPipeline::new().compose(Arc::new(FailingCleanup));
        let error = pipeline
            .run(context(), handler_fn(|_cx| async { Ok(()) }), Duration::from_secs(5))
            .await
            .expect_err("finalization failure propagates");
        assert!(matches!(error, CrawlError::PipelineFinalization { .. }));
    }
}
