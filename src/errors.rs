//! Error taxonomy for the crawling runtime
//!
//! Errors are classified by *kind* rather than by concrete type: the driver
//! decides between session rotation, throttling, retrying and failing based on
//! [`CrawlError::kind`]. Pipeline wrapper errors delegate classification to
//! their origin so a session error raised inside middleware setup still
//! triggers a rotation instead of consuming a retry slot.

use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

/// Classification of an error, driving the driver's recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Evidence the current session is blocked; rotate without a retry slot.
    Session,
    /// Evidence the current proxy is bad; escalate the tier and retry.
    Proxy,
    /// 429-equivalent; update the throttler and reclaim with a delay.
    RateLimit,
    /// Connection/TLS/timeout; counts as a retry.
    Transport,
    /// Error-class HTTP status; counts as a retry unless `no_retry`.
    HttpStatus,
    /// Parse or handler failure; surfaced to the error handler, then retried.
    Handler,
    /// Middleware setup failure.
    PipelineInitialization,
    /// Middleware cleanup failure.
    PipelineFinalization,
    /// Not an error: the request was deliberately skipped.
    Interrupted,
    /// Sticky session no longer available; fails without retry.
    Collision,
    /// Unrecoverable; the driver aborts.
    Fatal,
}

/// Error produced while processing a single request.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The target blocked the current session (transport block or a status
    /// code from the session's blocked set).
    #[error("session blocked: {reason}")]
    Session { reason: String },

    /// The current proxy is misbehaving or blocked.
    #[error("proxy error: {reason}")]
    Proxy { reason: String },

    /// HTTP 429 or an explicit `Retry-After`.
    #[error("rate limited (HTTP {status})")]
    RateLimit {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Connection-level failure: DNS, TLS, reset, timeout.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Response status fell into the configured error-status set.
    #[error("HTTP status {status}")]
    HttpStatus { status: u16 },

    /// The user request handler returned an error.
    #[error("request handler failed: {source}")]
    Handler {
        #[source]
        source: anyhow::Error,
    },

    /// The request handler did not finish within the configured timeout.
    #[error("request handler timed out after {timeout:?}")]
    HandlerTimeout { timeout: Duration },

    /// A middleware failed during its setup phase.
    #[error("context pipeline initialization failed: {source}")]
    PipelineInitialization {
        #[source]
        source: Box<CrawlError>,
    },

    /// A middleware failed during its cleanup phase.
    #[error("context pipeline finalization failed: {source}")]
    PipelineFinalization {
        #[source]
        source: Box<CrawlError>,
    },

    /// A middleware interrupted the pipeline; the request is handled-skipped.
    #[error("request skipped: {reason}")]
    PipelineInterrupted { reason: String },

    /// A request demanded a session that has been retired and purged.
    #[error("session {session_id} requested by {unique_key} is no longer available")]
    RequestCollision {
        session_id: String,
        unique_key: String,
    },

    /// The user-defined error handler itself failed; this is fatal.
    #[error("user-defined error handler failed: {source}")]
    UserHandler {
        #[source]
        source: anyhow::Error,
    },

    /// Programmer error raised at configuration time.
    #[error("service conflict: {0}")]
    ServiceConflict(String),

    /// Request queue / storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CrawlError {
    /// Build the appropriate error for an HTTP response status.
    #[must_use]
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        if status == 429 || retry_after.is_some() {
            Self::RateLimit {
                status,
                retry_after,
            }
        } else {
            Self::HttpStatus { status }
        }
    }

    /// Wrap an arbitrary handler error.
    #[must_use]
    pub fn handler(source: impl Into<anyhow::Error>) -> Self {
        Self::Handler {
            source: source.into(),
        }
    }

    /// Wrap a transport failure.
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Classify this error. Pipeline initialization errors delegate to their
    /// origin so recovery policy (rotation, throttling) is preserved through
    /// the wrapping.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Session { .. } => ErrorKind::Session,
            Self::Proxy { .. } => ErrorKind::Proxy,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::Handler { .. } | Self::HandlerTimeout { .. } => ErrorKind::Handler,
            Self::PipelineInitialization { source } => match source.kind() {
                ErrorKind::Session | ErrorKind::Proxy => source.kind(),
                ErrorKind::RateLimit => ErrorKind::RateLimit,
                _ => ErrorKind::PipelineInitialization,
            },
            Self::PipelineFinalization { .. } => ErrorKind::PipelineFinalization,
            Self::PipelineInterrupted { .. } => ErrorKind::Interrupted,
            Self::RequestCollision { .. } => ErrorKind::Collision,
            Self::UserHandler { .. } | Self::ServiceConflict(_) => ErrorKind::Fatal,
            Self::Storage(_) => ErrorKind::Fatal,
        }
    }

    /// Short name of the error kind, used by the error tracker.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Session => "SessionError",
            ErrorKind::Proxy => "ProxyError",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::Transport => "TransportError",
            ErrorKind::HttpStatus => "HttpStatusError",
            ErrorKind::Handler => "RequestHandlerError",
            ErrorKind::PipelineInitialization => "ContextPipelineInitializationError",
            ErrorKind::PipelineFinalization => "ContextPipelineFinalizationError",
            ErrorKind::Interrupted => "ContextPipelineInterruptedError",
            ErrorKind::Collision => "RequestCollisionError",
            ErrorKind::Fatal => "FatalError",
        }
    }

    /// Whether this error is evidence of a blocked session, given the
    /// session's blocked status codes.
    #[must_use]
    pub fn is_session_error(&self, blocked_status_codes: &[u16]) -> bool {
        match self.kind() {
            ErrorKind::Session | ErrorKind::Proxy => true,
            ErrorKind::HttpStatus => match self.status() {
                Some(status) => blocked_status_codes.contains(&status),
                None => false,
            },
            _ => false,
        }
    }

    /// The HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimit { status, .. } | Self::HttpStatus { status } => Some(*status),
            Self::PipelineInitialization { source } => source.status(),
            _ => None,
        }
    }

    /// The `Retry-After` delay carried by this error, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            Self::PipelineInitialization { source } => source.retry_after(),
            _ => None,
        }
    }
}
