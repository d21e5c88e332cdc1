//! Request loaders and the loader/queue tandem
//!
//! A loader streams requests out of an external source (a static list, a
//! sitemap cursor, ...). A tandem pairs a read-only loader with a writable
//! queue: loader items get transferred into the queue as they are consumed,
//! so handlers can enqueue new requests alongside the loaded ones.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;

use crate::request::Request;

use super::StorageError;
use super::request_queue::{AddRequestResult, RequestProvider, RequestQueue};

/// Read-only source of requests.
#[async_trait]
pub trait RequestLoader: Send + Sync {
    /// Next request from the source, `None` when nothing is available now.
    async fn fetch_next_request(&self) -> Option<Request>;

    /// Return a fetched request to the source's logical position.
    async fn reclaim_request(&self, request: Request);

    /// Mark a fetched request as consumed.
    async fn mark_request_as_handled(&self, request: Request);

    async fn is_empty(&self) -> bool;

    /// Exhausted and everything fetched was handled.
    async fn is_finished(&self) -> bool;

    async fn total_count(&self) -> usize;

    async fn handled_count(&self) -> usize;
}

#[derive(Debug, Default)]
struct RequestListInner {
    pending: VecDeque<Request>,
    in_flight: usize,
    handled: usize,
    total: usize,
}

/// Finite in-memory loader over a list of seed requests.
#[derive(Debug, Default)]
pub struct RequestList {
    inner: Mutex<RequestListInner>,
}

impl RequestList {
    #[must_use]
    pub fn new(requests: impl IntoIterator<Item = Request>) -> Self {
        let pending: VecDeque<Request> = requests.into_iter().collect();
        let total = pending.len();
        Self {
            inner: Mutex::new(RequestListInner {
                pending,
                in_flight: 0,
                handled: 0,
                total,
            }),
        }
    }

    /// Convenience constructor from plain URLs.
    #[must_use]
    pub fn from_urls<S: AsRef<str>>(urls: impl IntoIterator<Item = S>) -> Self {
        Self::new(urls.into_iter().map(|url| Request::new(url.as_ref())))
    }
}

#[async_trait]
impl RequestLoader for RequestList {
    async fn fetch_next_request(&self) -> Option<Request> {
        let mut inner = self.inner.lock();
        let request = inner.pending.pop_front();
        if request.is_some() {
            inner.in_flight += 1;
        }
        request
    }

    async fn reclaim_request(&self, request: Request) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.pending.push_front(request);
    }

    async fn mark_request_as_handled(&self, _request: Request) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.handled += 1;
    }

    async fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    async fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.is_empty() && inner.in_flight == 0
    }

    async fn total_count(&self) -> usize {
        self.inner.lock().total
    }

    async fn handled_count(&self) -> usize {
        self.inner.lock().handled
    }
}

/// Pairs a [`RequestLoader`] with a [`RequestQueue`].
///
/// Fetching drains the loader into the queue (at the forefront, so loaded
/// requests keep their priority over handler-enqueued ones) and then consumes
/// from the queue. The tandem is finished only when both sides are.
pub struct RequestLoaderTandem {
    loader: Arc<dyn RequestLoader>,
    queue: Arc<RequestQueue>,
}

impl RequestLoaderTandem {
    #[must_use]
    pub fn new(loader: Arc<dyn RequestLoader>, queue: Arc<RequestQueue>) -> Self {
        Self { loader, queue }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }
}

#[async_trait]
impl RequestProvider for RequestLoaderTandem {
    async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, StorageError> {
        self.queue.add_request(request, forefront).await
    }

    async fn add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>, StorageError> {
        self.queue.add_requests(requests, forefront).await
    }

    async fn fetch_next_request(&self) -> Result<Option<Request>, StorageError> {
        if !self.loader.is_finished().await {
            if let Some(request) = self.loader.fetch_next_request().await {
                match self.queue.add_request(request.clone(), true).await {
                    Ok(_) => self.loader.mark_request_as_handled(request).await,
                    Err(e) => {
                        warn!(
                            "Transferring request from loader to queue failed, reclaiming: {e}"
                        );
                        self.loader.reclaim_request(request).await;
                        return Ok(None);
                    }
                }
            }
        }
        self.queue.fetch_next_request().await
    }

    async fn reclaim_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<(), StorageError> {
        self.queue.reclaim_request(request, forefront).await
    }

    async fn mark_request_as_handled(&self, request: Request) -> Result<(), StorageError> {
        self.queue.mark_request_as_handled(request).await
    }

    async fn is_empty(&self) -> bool {
        self.loader.is_empty().await && self.queue.is_empty().await
    }

    async fn is_finished(&self) -> bool {
        self.loader.is_finished().await && self.queue.is_finished().await
    }

    async fn handled_count(&self) -> usize {
        self.queue.handled_count().await
    }

    async fn total_count(&self) -> usize {
        self.loader.total_count().await + self.queue.total_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::request_queue::RequestQueueOptions;

    #[tokio::test]
    async fn request_list_drains_in_order() {
        let list = RequestList::from_urls(["http://h/a", "http://h/b"]);
        assert_eq!(list.total_count().await, 2);

        let first = list.fetch_next_request().await.expect("a");
        assert_eq!(first.url, "http://h/a");
        list.mark_request_as_handled(first).await;

        let second = list.fetch_next_request().await.expect("b");
        assert!(!list.is_finished().await, "in-flight request blocks finish");
        list.mark_request_as_handled(second).await;
        assert!(list.is_finished().await);
        assert_eq!(list.handled_count().await, 2);
    }

    #[tokio::test]
    async fn request_list_reclaim_restores_position() {
        let list = RequestList::from_urls(["http://h/a", "http://h/b"]);
        let first = list.fetch_next_request().await.expect("a");
        list.reclaim_request(first).await;
        let again = list.fetch_next_request().await.expect("a again");
        assert_eq!(again.url, "http://h/a");
    }

    #[tokio::test]
    async fn tandem_moves_loader_items_through_the_queue() {
        let loader = Arc::new(RequestList::from_urls(["http://h/a", "http://h/b"]));
        let queue = Arc::new(RequestQueue::new(RequestQueueOptions::default()));
        let tandem = RequestLoaderTandem::new(loader, Arc::clone(&queue));

        let first = tandem
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request available");
        assert_eq!(first.url, "http://h/a");
        tandem.mark_request_as_handled(first).await.expect("mark");

        // Handler-enqueued request interleaves behind loaded forefront items.
        tandem
            .add_request(Request::new("http://h/new"), false)
            .await
            .expect("add");

        let second = tandem
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request available");
        assert_eq!(second.url, "http://h/b");
        tandem.mark_request_as_handled(second).await.expect("mark");

        let third = tandem
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request available");
        assert_eq!(third.url, "http://h/new");
        tandem.mark_request_as_handled(third).await.expect("mark");

        assert!(tandem.is_finished().await);
        assert_eq!(tandem.handled_count().await, 3);
    }

    #[tokio::test]
    async fn tandem_finished_requires_both_sides() {
        let loader = Arc::new(RequestList::from_urls(["http://h/a"]));
        let queue = Arc::new(RequestQueue::new(RequestQueueOptions::default()));
        let tandem = RequestLoaderTandem::new(Arc::clone(&loader) as Arc<dyn RequestLoader>, queue);

        assert!(!tandem.is_finished().await);
        let request = tandem
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request available");
        assert!(loader.is_finished().await, "loader side drained");
        assert!(!tandem.is_finished().await, "queue still has the lease");
        tandem.mark_request_as_handled(request).await.expect("mark");
        assert!(tandem.is_finished().await);
    }
}
