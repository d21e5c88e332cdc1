//! Deduplicated, ordered request queue
//!
//! Requests are partitioned by `unique_key` into *pending*, *in progress* and
//! *handled*; a key lives in at most one partition. Pending is two FIFO
//! sub-deques: *front* receives forefront inserts (newest first), *back*
//! receives normal inserts; fetching drains front before back.
//!
//! All mutation happens under a single small lock that is never held across a
//! suspension point, so every method appears atomic to concurrent workers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::request::{Request, RequestState};

use super::StorageError;

/// Outcome of adding a request to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequestResult {
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// Queue construction options.
#[derive(Debug, Clone, Default)]
pub struct RequestQueueOptions {
    pub name: Option<String>,
    /// With keep-alive, `is_finished` only turns true after an explicit
    /// [`RequestQueue::close`], even when the queue is temporarily empty.
    pub keep_alive: bool,
}

/// Queue metadata, mirrored into the persisted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestQueueMetadata {
    pub had_multiple_clients: bool,
    pub handled_request_count: usize,
    pub pending_request_count: usize,
    pub total_request_count: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    front: VecDeque<String>,
    back: VecDeque<String>,
    requests: HashMap<String, Request>,
    in_progress: HashSet<String>,
    handled: HashSet<String>,
    dropped: bool,
}

impl QueueInner {
    fn is_pending(&self, key: &str) -> bool {
        self.requests.contains_key(key)
            && !self.in_progress.contains(key)
            && !self.handled.contains(key)
    }

    fn pending_count(&self) -> usize {
        self.front.len() + self.back.len()
    }
}

/// Interface shared by the queue and the loader/queue tandem; the driver only
/// talks to this trait.
#[async_trait]
pub trait RequestProvider: Send + Sync {
    async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, StorageError>;

    async fn add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>, StorageError>;

    async fn fetch_next_request(&self) -> Result<Option<Request>, StorageError>;

    async fn reclaim_request(&self, request: Request, forefront: bool)
    -> Result<(), StorageError>;

    async fn mark_request_as_handled(&self, request: Request) -> Result<(), StorageError>;

    async fn is_empty(&self) -> bool;

    async fn is_finished(&self) -> bool;

    async fn handled_count(&self) -> usize;

    async fn total_count(&self) -> usize;
}

/// In-memory request queue with dedup, forefront ordering and lease tracking.
pub struct RequestQueue {
    id: String,
    name: Option<String>,
    keep_alive: bool,
    closed: AtomicBool,
    inner: Mutex<QueueInner>,
}

impl RequestQueue {
    #[must_use]
    pub fn new(options: RequestQueueOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: options.name,
            keep_alive: options.keep_alive,
            closed: AtomicBool::new(false),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Explicitly close a keep-alive queue so `is_finished` can turn true.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn add_request_inner(
        inner: &mut QueueInner,
        mut request: Request,
        forefront: bool,
    ) -> AddRequestResult {
        let unique_key = request.unique_key.clone();

        if inner.requests.contains_key(&unique_key) {
            return AddRequestResult {
                was_already_handled: inner.handled.contains(&unique_key),
                was_already_present: true,
                unique_key,
            };
        }

        request.state = RequestState::Requested;
        inner.requests.insert(unique_key.clone(), request);
        if forefront {
            // A later forefront insert outranks earlier ones.
            inner.front.push_front(unique_key.clone());
        } else {
            inner.back.push_back(unique_key.clone());
        }

        AddRequestResult {
            unique_key,
            was_already_present: false,
            was_already_handled: false,
        }
    }

    /// Add a request; a no-op returning the current status when the key is
    /// already present in any partition.
    pub fn add_request_sync(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, StorageError> {
        let mut inner = self.inner.lock();
        if inner.dropped {
            return Err(StorageError::QueueDropped);
        }
        Ok(Self::add_request_inner(&mut inner, request, forefront))
    }

    /// Bulk insert with dedup against existing keys (and within the batch).
    pub fn add_requests_sync(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>, StorageError> {
        let mut inner = self.inner.lock();
        if inner.dropped {
            return Err(StorageError::QueueDropped);
        }
        Ok(requests
            .into_iter()
            .map(|request| Self::add_request_inner(&mut inner, request, forefront))
            .collect())
    }

    /// Pop the next pending request and lease it (front before back, FIFO
    /// within each). Returns `None` when nothing is currently available.
    pub fn fetch_next_request_sync(&self) -> Result<Option<Request>, StorageError> {
        let mut inner = self.inner.lock();
        if inner.dropped {
            return Err(StorageError::QueueDropped);
        }

        let Some(unique_key) = inner
            .front
            .pop_front()
            .or_else(|| inner.back.pop_front())
        else {
            return Ok(None);
        };

        let leased = match inner.requests.get_mut(&unique_key) {
            Some(request) => {
                request.state = RequestState::InProgress;
                Some(request.clone())
            }
            None => None,
        };
        match leased {
            Some(request) => {
                inner.in_progress.insert(unique_key);
                Ok(Some(request))
            }
            None => {
                // Ordering deques and the request map are mutated together;
                // a missing record here means internal corruption.
                warn!("Queue record missing for leased key {unique_key}");
                Ok(None)
            }
        }
    }

    /// Return a leased request to pending, keeping any mutations the caller
    /// made to it. Idempotent when the request is already pending.
    pub fn reclaim_request_sync(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.dropped {
            return Err(StorageError::QueueDropped);
        }
        let unique_key = request.unique_key.clone();

        if inner.is_pending(&unique_key) {
            inner.requests.insert(unique_key, request);
            return Ok(());
        }
        if !inner.in_progress.remove(&unique_key) {
            return Err(StorageError::NotInProgress { unique_key });
        }

        let mut stored = request;
        stored.state = RequestState::Requested;
        inner.requests.insert(unique_key.clone(), stored);
        if forefront {
            inner.front.push_front(unique_key);
        } else {
            inner.back.push_back(unique_key);
        }
        Ok(())
    }

    /// Move a leased request to handled. Idempotent for already-handled keys,
    /// an error for keys that were never fetched.
    pub fn mark_request_as_handled_sync(&self, request: Request) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.dropped {
            return Err(StorageError::QueueDropped);
        }
        let unique_key = request.unique_key.clone();

        if inner.handled.contains(&unique_key) {
            return Ok(());
        }
        if !inner.in_progress.remove(&unique_key) {
            return Err(StorageError::NotInProgress { unique_key });
        }

        let mut stored = request;
        // Permanently failed requests keep their state through the handled
        // partition; everything else becomes handled.
        if stored.state != RequestState::Failed {
            stored.state = RequestState::Handled;
        }
        stored.handled_at = Some(chrono::Utc::now());
        inner.requests.insert(unique_key.clone(), stored);
        inner.handled.insert(unique_key);
        Ok(())
    }

    /// True iff no request is pending (leased requests may still exist).
    #[must_use]
    pub fn is_empty_sync(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending_count() == 0
    }

    /// True iff pending and in-progress are both empty and the queue is not
    /// in keep-alive mode (or was explicitly closed).
    #[must_use]
    pub fn is_finished_sync(&self) -> bool {
        let inner = self.inner.lock();
        if inner.dropped {
            return true;
        }
        let drained = inner.pending_count() == 0 && inner.in_progress.is_empty();
        drained && (!self.keep_alive || self.closed.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn in_progress_count(&self) -> usize {
        self.inner.lock().in_progress.len()
    }

    #[must_use]
    pub fn handled_count_sync(&self) -> usize {
        self.inner.lock().handled.len()
    }

    #[must_use]
    pub fn total_count_sync(&self) -> usize {
        self.inner.lock().requests.len()
    }

    #[must_use]
    pub fn metadata(&self) -> RequestQueueMetadata {
        let inner = self.inner.lock();
        RequestQueueMetadata {
            had_multiple_clients: false,
            handled_request_count: inner.handled.len(),
            pending_request_count: inner.pending_count(),
            total_request_count: inner.requests.len(),
        }
    }

    /// Remove the queue and all its state; later operations fail.
    pub fn drop_queue(&self) {
        let mut inner = self.inner.lock();
        inner.front.clear();
        inner.back.clear();
        inner.requests.clear();
        inner.in_progress.clear();
        inner.handled.clear();
        inner.dropped = true;
        debug!("Request queue {} dropped", self.id);
    }

    /// Best-effort dump of the queue into a directory: one JSON record per
    /// request plus `order.json` and `metadata.json`.
    pub async fn persist_to_dir(&self, dir: impl AsRef<Path>) -> Result<(), StorageError> {
        let dir = dir.as_ref().to_path_buf();
        let (snapshot, requests) = {
            let inner = self.inner.lock();
            if inner.dropped {
                return Err(StorageError::QueueDropped);
            }
            let snapshot = QueueOrderSnapshot {
                front: inner.front.iter().cloned().collect(),
                back: inner.back.iter().cloned().collect(),
                in_progress: inner.in_progress.iter().cloned().collect(),
                handled: inner.handled.iter().cloned().collect(),
            };
            let requests: Vec<Request> = inner.requests.values().cloned().collect();
            (snapshot, requests)
        };

        let requests_dir = dir.join("requests");
        tokio::fs::create_dir_all(&requests_dir).await?;

        for request in &requests {
            let path = requests_dir.join(format!("{}.json", record_file_name(&request.unique_key)));
            let bytes = serde_json::to_vec_pretty(request)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            tokio::fs::write(path, bytes).await?;
        }

        let order_bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        tokio::fs::write(dir.join("order.json"), order_bytes).await?;

        let metadata_bytes = serde_json::to_vec_pretty(&self.metadata())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        tokio::fs::write(dir.join("metadata.json"), metadata_bytes).await?;
        Ok(())
    }

    /// Restore a queue from a directory written by [`Self::persist_to_dir`].
    /// Requests that were in progress at dump time are reclaimed to the
    /// forefront so a crashed run does not lose them.
    pub async fn restore_from_dir(
        dir: impl AsRef<Path>,
        options: RequestQueueOptions,
    ) -> Result<Self, StorageError> {
        let dir: PathBuf = dir.as_ref().to_path_buf();
        let order_bytes = tokio::fs::read(dir.join("order.json")).await?;
        let snapshot: QueueOrderSnapshot = serde_json::from_slice(&order_bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let requests_dir = dir.join("requests");
        let mut requests = HashMap::new();
        let mut entries = tokio::fs::read_dir(&requests_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let bytes = tokio::fs::read(entry.path()).await?;
            let request: Request = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            requests.insert(request.unique_key.clone(), request);
        }

        let queue = Self::new(options);
        {
            let mut inner = queue.inner.lock();
            inner.requests = requests;
            // Interrupted leases come back at the head of the queue.
            for key in &snapshot.in_progress {
                inner.front.push_back(key.clone());
            }
            inner.front.extend(snapshot.front.iter().cloned());
            inner.back = snapshot.back.into_iter().collect();
            inner.handled = snapshot.handled.into_iter().collect();
        }
        Ok(queue)
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(RequestQueueOptions::default())
    }
}

#[async_trait]
impl RequestProvider for RequestQueue {
    async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<AddRequestResult, StorageError> {
        self.add_request_sync(request, forefront)
    }

    async fn add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>, StorageError> {
        self.add_requests_sync(requests, forefront)
    }

    async fn fetch_next_request(&self) -> Result<Option<Request>, StorageError> {
        self.fetch_next_request_sync()
    }

    async fn reclaim_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<(), StorageError> {
        self.reclaim_request_sync(request, forefront)
    }

    async fn mark_request_as_handled(&self, request: Request) -> Result<(), StorageError> {
        self.mark_request_as_handled_sync(request)
    }

    async fn is_empty(&self) -> bool {
        self.is_empty_sync()
    }

    async fn is_finished(&self) -> bool {
        self.is_finished_sync()
    }

    async fn handled_count(&self) -> usize {
        self.handled_count_sync()
    }

    async fn total_count(&self) -> usize {
        self.total_count_sync()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueOrderSnapshot {
    front: Vec<String>,
    back: Vec<String>,
    in_progress: Vec<String>,
    handled: Vec<String>,
}

/// Filesystem-safe record name derived from the unique key.
fn record_file_name(unique_key: &str) -> String {
    let digest = Sha256::digest(unique_key.as_bytes());
    digest
        .iter()
        .take(16)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
