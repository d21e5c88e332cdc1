//! Per-request work unit
//!
//! One invocation processes one request end to end: fetch from the queue,
//! check the throttler, acquire session and proxy (strictly in that order),
//! run the pipeline around the routed handler, then apply the outcome policy:
//! commit staged effects on success, rotate sessions on block evidence,
//! reclaim with delay on rate limits, retry or fail everything else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::errors::{CrawlError, ErrorKind};
use crate::pipeline::{CrawlingContext, RequestHandler};
use crate::request::{Request, RequestState};
use crate::session::Session;
use crate::stats::generic_message;

use super::CrawlerInner;

/// Upper bound on how long a worker sleeps before reclaiming a throttled
/// request; longer waits are served by later fetches re-checking the
/// throttler.
const MAX_THROTTLE_SLEEP: Duration = Duration::from_secs(5);

/// Identical pipeline failures tolerated before a request fails outright.
const DETERMINISTIC_FAILURE_LIMIT: u32 = 3;

pub(crate) async fn process_one(inner: Arc<CrawlerInner>) {
    let request = match inner.provider.fetch_next_request().await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(e) => {
            error!("Fetching next request failed: {e}");
            return;
        }
    };

    if inner.stop.is_stopped() {
        reclaim(&inner, request, false).await;
        return;
    }

    // Deferred dispatch: the domain is cooling down after a 429.
    if inner.throttler.is_throttled(&request.url) {
        let delay = inner.throttler.get_delay(&request.url).min(MAX_THROTTLE_SLEEP);
        debug!(
            "Domain of {} is rate limited, deferring for {delay:?}",
            request.url
        );
        tokio::time::sleep(delay).await;
        reclaim(&inner, request, false).await;
        return;
    }

    let session = match acquire_session(&inner, &request) {
        Ok(session) => session,
        Err(collision) => {
            warn!("{collision}");
            finalize_failure(&inner, request, &collision, Duration::ZERO).await;
            return;
        }
    };

    let proxy_info = inner.proxy_config.as_ref().and_then(|proxies| {
        let session_id = request
            .session_id
            .as_deref()
            .or(session.as_deref().map(Session::id));
        proxies.new_proxy_info(session_id, &request.url)
    });

    let started = Instant::now();
    let mut context = CrawlingContext::new(request.clone(), Arc::clone(&inner.services));
    context.session = session.clone();
    context.proxy_info = proxy_info;

    let router = Arc::clone(&inner.router);
    let handler: RequestHandler = Arc::new(move |cx| router.dispatch(cx));

    let result = inner
        .pipeline
        .run(
            context.clone(),
            handler,
            inner.options.request_handler_timeout,
        )
        .await;
    let duration = started.elapsed();

    match result {
        Ok(()) => on_success(&inner, request, &context, session.as_ref(), duration).await,
        Err(error) => on_failure(&inner, request, session, error, duration).await,
    }
}

fn acquire_session(
    inner: &CrawlerInner,
    request: &Request,
) -> Result<Option<Arc<Session>>, CrawlError> {
    let Some(pool) = &inner.session_pool else {
        return Ok(None);
    };
    match &request.session_id {
        Some(session_id) => pool
            .get_session_by_id(session_id)
            .map(Some)
            .ok_or_else(|| CrawlError::RequestCollision {
                session_id: session_id.clone(),
                unique_key: request.unique_key.clone(),
            }),
        None => Ok(Some(pool.get_session())),
    }
}

async fn reclaim(inner: &CrawlerInner, request: Request, forefront: bool) {
    let unique_key = request.unique_key.clone();
    if let Err(e) = inner.provider.reclaim_request(request, forefront).await {
        error!("Reclaiming request {unique_key} failed: {e}");
    }
}

async fn on_success(
    inner: &CrawlerInner,
    request: Request,
    context: &CrawlingContext,
    session: Option<&Arc<Session>>,
    duration: Duration,
) {
    // Commit staged side effects; a failed handler never reaches this point,
    // so data and links are all-or-nothing per invocation.
    let (data, new_requests) = context.take_staged();
    if !data.is_empty()
        && let Err(e) = inner.services.dataset.push_data(data).await
    {
        error!("Committing dataset items for {} failed: {e}", request.url);
    }
    if !new_requests.is_empty()
        && let Err(e) = inner.provider.add_requests(new_requests, false).await
    {
        error!("Enqueueing discovered requests for {} failed: {e}", request.url);
    }

    if let Err(e) = inner.provider.mark_request_as_handled(request.clone()).await {
        error!("Marking {} as handled failed: {e}", request.unique_key);
    }

    inner.throttler.record_success(&request.url);
    if let Some(session) = session {
        session.mark_good();
    }
    if let Some(proxies) = &inner.proxy_config {
        proxies.note_success(&request.url);
    }
    inner
        .stats
        .record_request_finished(request.retry_count, duration);
    inner.pipeline_failures.remove(&request.unique_key);
    debug!("Handled {} in {duration:?}", request.url);

    check_request_cap(inner);
}

async fn on_failure(
    inner: &CrawlerInner,
    mut request: Request,
    session: Option<Arc<Session>>,
    error: CrawlError,
    duration: Duration,
) {
    match error.kind() {
        ErrorKind::Interrupted => {
            on_skipped(inner, request, &error).await;
            return;
        }
        ErrorKind::Fatal => {
            error!("Fatal error while processing {}: {error}", request.url);
            reclaim(inner, request, false).await;
            *inner.fatal.lock() = Some(error);
            inner.stop.stop("fatal error");
            inner.pool.abort();
            return;
        }
        ErrorKind::Collision => {
            finalize_failure(inner, request, &error, duration).await;
            return;
        }
        // Rate limits are handled before session-block evidence: a 429 feeds
        // the throttler, not the rotation machinery.
        ErrorKind::RateLimit => {
            inner
                .throttler
                .record_rate_limit(&request.url, error.retry_after());
            inner.monitor.register_client_error();
            reclaim(inner, request, false).await;
            return;
        }
        ErrorKind::Proxy => {
            if let Some(proxies) = &inner.proxy_config {
                proxies.note_failure(&request.url);
            }
        }
        _ => {}
    }

    let blocked_status_codes = session
        .as_ref()
        .map(|s| s.blocked_status_codes().to_vec())
        .unwrap_or_else(|| {
            inner
                .options
                .session_pool
                .session_options
                .blocked_status_codes
                .clone()
        });

    if error.is_session_error(&blocked_status_codes) {
        rotate_session(inner, request, session, &error, duration).await;
        return;
    }

    if let Some(session) = &session {
        session.mark_bad();
    }

    // Deterministic pipeline failures short-circuit the retry budget.
    let kind = error.kind();
    if matches!(
        kind,
        ErrorKind::PipelineInitialization | ErrorKind::PipelineFinalization
    ) && is_deterministic_failure(inner, &request, &error)
    {
        warn!(
            "Pipeline failure for {} repeated {DETERMINISTIC_FAILURE_LIMIT} times, giving up",
            request.url
        );
        request.retry_count += 1;
        finalize_failure(inner, request, &error, duration).await;
        return;
    }

    let max_retries = request.effective_max_retries(inner.options.max_request_retries);
    let will_retry = !request.no_retry && request.retry_count < max_retries;

    if !will_retry {
        request.retry_count += 1;
        finalize_failure(inner, request, &error, duration).await;
        return;
    }

    // Surface handler/status errors to the user error handler before the
    // retry; it may mutate the request (identity excepted).
    if matches!(
        kind,
        ErrorKind::Handler
            | ErrorKind::HttpStatus
            | ErrorKind::PipelineInitialization
            | ErrorKind::PipelineFinalization
    ) && let Some(error_handler) = &inner.error_handler
    {
        match error_handler(request.clone(), &error).await {
            Ok(mut mutated) => {
                if mutated.unique_key != request.unique_key {
                    warn!("Error handler must not change the unique key; keeping the original");
                    mutated.unique_key = request.unique_key.clone();
                }
                request = mutated;
            }
            Err(handler_error) => {
                let fatal = CrawlError::UserHandler {
                    source: handler_error,
                };
                error!("{fatal}");
                reclaim(inner, request, false).await;
                *inner.fatal.lock() = Some(fatal);
                inner.stop.stop("fatal error");
                inner.pool.abort();
                return;
            }
        }
    }

    request.retry_count += 1;
    debug!(
        "Retrying {} (attempt {}/{}): {error}",
        request.url,
        request.retry_count,
        max_retries + 1
    );
    reclaim(inner, request, true).await;
}

/// Session-block evidence: retire the session and retry without consuming a
/// retry slot, bounded by `max_session_rotations`.
async fn rotate_session(
    inner: &CrawlerInner,
    mut request: Request,
    session: Option<Arc<Session>>,
    error: &CrawlError,
    duration: Duration,
) {
    if let Some(session) = &session {
        if let Some(pool) = &inner.session_pool {
            pool.retire_session(session);
        }
        if let Some(proxies) = &inner.proxy_config {
            proxies.forget_session(session.id());
        }
    }

    if request.session_rotation_count < inner.options.max_session_rotations {
        request.session_rotation_count += 1;
        debug!(
            "Rotating session for {} ({}/{})",
            request.url, request.session_rotation_count, inner.options.max_session_rotations
        );
        reclaim(inner, request, true).await;
    } else {
        warn!(
            "Session rotations exhausted for {}: {error}",
            request.url
        );
        finalize_failure(inner, request, error, duration).await;
    }
}

async fn on_skipped(inner: &CrawlerInner, request: Request, error: &CrawlError) {
    let reason = match error {
        CrawlError::PipelineInterrupted { reason } => reason.clone(),
        other => other.to_string(),
    };
    info!("Skipping {}: {reason}", request.url);
    if let Err(e) = inner.provider.mark_request_as_handled(request.clone()).await {
        error!("Marking skipped request {} failed: {e}", request.unique_key);
    }
    if let Some(callback) = &inner.on_skipped_request {
        callback(&request, &reason).await;
    }
}

async fn finalize_failure(
    inner: &CrawlerInner,
    mut request: Request,
    error: &CrawlError,
    duration: Duration,
) {
    warn!("Request {} failed permanently: {error}", request.url);
    request.state = RequestState::Failed;
    if let Err(e) = inner.provider.mark_request_as_handled(request.clone()).await {
        error!("Marking failed request {} failed: {e}", request.unique_key);
    }

    inner
        .stats
        .record_request_failed(request.retry_count, duration);
    inner
        .error_tracker
        .add(error.kind_name(), &error.to_string(), None);
    inner.pipeline_failures.remove(&request.unique_key);

    if let Some(callback) = &inner.failed_request_handler {
        callback(&request, error).await;
    }

    check_request_cap(inner);
}

/// Returns true when this request has now seen the same pipeline error
/// `DETERMINISTIC_FAILURE_LIMIT` times in a row.
fn is_deterministic_failure(inner: &CrawlerInner, request: &Request, error: &CrawlError) -> bool {
    let signature = generic_message(&error.to_string());
    let mut entry = inner
        .pipeline_failures
        .entry(request.unique_key.clone())
        .or_insert_with(|| (signature.clone(), 0));
    if entry.0 == signature {
        entry.1 += 1;
    } else {
        *entry = (signature, 1);
    }
    entry.1 >= DETERMINISTIC_FAILURE_LIMIT
}

fn check_request_cap(inner: &CrawlerInner) {
    let Some(cap) = inner.options.max_requests_per_crawl else {
        return;
    };
    let state = inner.stats.snapshot();
    if state.requests_finished + state.requests_failed >= cap && !inner.stop.is_stopped() {
        info!("Reached max_requests_per_crawl ({cap}), stopping the crawl");
        inner.stop.stop("limit reached");
        inner.queue.close();
    }
}
