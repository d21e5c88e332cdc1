//! Storage collaborators and the request queue
//!
//! The queue (with its ordering and dedup invariants) is part of the core;
//! datasets and key-value stores are abstract collaborators with in-memory
//! implementations, plus a file-system key-value store used for best-effort
//! state persistence.

pub mod dataset;
pub mod key_value_store;
pub mod request_loader;
pub mod request_queue;

use thiserror::Error;

pub use dataset::{Dataset, DatasetPage, ExportFormat, MemoryDataset};
pub use key_value_store::{FileSystemKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use request_loader::{RequestList, RequestLoader, RequestLoaderTandem};
pub use request_queue::{
    AddRequestResult, RequestProvider, RequestQueue, RequestQueueMetadata, RequestQueueOptions,
};

/// Failures from storage backends and the request queue.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `mark_request_as_handled` for a request that was never fetched.
    #[error("request {unique_key} is not in progress")]
    NotInProgress { unique_key: String },

    /// Operation on a queue that has been dropped.
    #[error("request queue has been dropped")]
    QueueDropped,
}
