//! Label-based request routing
//!
//! Handlers are registered per label; a request's `user_data.label` picks the
//! handler, falling back to the default handler when no label matches.
//! Registering the same label twice is a programmer error and panics at
//! configuration time.

use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::errors::CrawlError;
use crate::pipeline::{CrawlingContext, RequestHandler, handler_fn};

/// Dispatch table from label to handler.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, RequestHandler>,
    default_handler: Option<RequestHandler>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for requests with the given label.
    ///
    /// # Panics
    /// Panics when a handler for this label is already registered.
    pub fn add_handler<F, Fut>(&mut self, label: impl Into<String>, f: F)
    where
        F: Fn(CrawlingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        let label = label.into();
        assert!(
            !self.handlers.contains_key(&label),
            "a handler for label {label:?} is already registered"
        );
        self.handlers.insert(label, handler_fn(f));
    }

    /// Register the handler for requests without a matching label.
    ///
    /// # Panics
    /// Panics when a default handler is already registered.
    pub fn set_default_handler<F, Fut>(&mut self, f: F)
    where
        F: Fn(CrawlingContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        assert!(
            self.default_handler.is_none(),
            "a default handler is already registered"
        );
        self.default_handler = Some(handler_fn(f));
    }

    #[must_use]
    pub fn has_default_handler(&self) -> bool {
        self.default_handler.is_some()
    }

    /// Resolve the handler for a label: exact match, then default.
    pub fn route(&self, label: Option<&str>) -> Result<RequestHandler, CrawlError> {
        if let Some(label) = label
            && let Some(handler) = self.handlers.get(label)
        {
            return Ok(handler.clone());
        }
        match &self.default_handler {
            Some(handler) => Ok(handler.clone()),
            None => Err(CrawlError::handler(anyhow::anyhow!(
                "no handler registered for label {label:?} and no default handler set"
            ))),
        }
    }

    /// Dispatch a context to its handler.
    pub fn dispatch(&self, context: CrawlingContext) -> BoxFuture<'static, Result<(), CrawlError>> {
        let label = context.request.label().map(str::to_string);
        match self.route(label.as_deref()) {
            Ok(handler) => handler(context),
            Err(error) => Box::pin(async move { Err(error) }),
        }
    }
}
