//! Dataset collaborator
//!
//! An append-only store for the structured records handlers produce via
//! `push_data`. The core only relies on the trait; the in-memory
//! implementation is the default.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::StorageError;

/// One page of dataset items.
#[derive(Debug, Clone)]
pub struct DatasetPage {
    pub items: Vec<Value>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub desc: bool,
}

/// Export formats supported by [`Dataset::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// A single JSON array.
    Json,
    /// Newline-delimited JSON, one item per line.
    Jsonl,
}

/// Abstract append-only item store.
#[async_trait]
pub trait Dataset: Send + Sync {
    async fn push_data(&self, items: Vec<Value>) -> Result<(), StorageError>;
    async fn get_data(
        &self,
        offset: usize,
        limit: usize,
        desc: bool,
    ) -> Result<DatasetPage, StorageError>;
    async fn item_count(&self) -> usize;
    async fn export(&self, format: ExportFormat) -> Result<String, StorageError>;
}

/// In-memory dataset.
#[derive(Debug, Default)]
pub struct MemoryDataset {
    items: Mutex<Vec<Value>>,
}

impl MemoryDataset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Dataset for MemoryDataset {
    async fn push_data(&self, mut new_items: Vec<Value>) -> Result<(), StorageError> {
        self.items.lock().append(&mut new_items);
        Ok(())
    }

    async fn get_data(
        &self,
        offset: usize,
        limit: usize,
        desc: bool,
    ) -> Result<DatasetPage, StorageError> {
        let items = self.items.lock();
        let total = items.len();
        let page: Vec<Value> = if desc {
            items.iter().rev().skip(offset).take(limit).cloned().collect()
        } else {
            items.iter().skip(offset).take(limit).cloned().collect()
        };
        Ok(DatasetPage {
            items: page,
            total,
            offset,
            limit,
            desc,
        })
    }

    async fn item_count(&self) -> usize {
        self.items.lock().len()
    }

    async fn export(&self, format: ExportFormat) -> Result<String, StorageError> {
        let items = self.items.lock();
        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&*items)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            ExportFormat::Jsonl => {
                let mut out = String::new();
                for item in items.iter() {
                    let line = serde_json::to_string(item)
                        .map_err(|e| StorageError::Serialization(e.to_string()))?;
                    out.push_str(&line);
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn push_and_page() {
        let dataset = MemoryDataset::new();
        dataset
            .push_data(vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
            .await
            .expect("push succeeds");

        let page = dataset.get_data(1, 1, false).await.expect("page");
        assert_eq!(page.items, vec![json!({"n": 2})]);
        assert_eq!(page.total, 3);

        let last = dataset.get_data(0, 1, true).await.expect("desc page");
        assert_eq!(last.items, vec![json!({"n": 3})]);
    }

    #[tokio::test]
    async fn export_jsonl_is_line_per_item() {
        let dataset = MemoryDataset::new();
        dataset
            .push_data(vec![json!({"a": 1}), json!({"b": 2})])
            .await
            .expect("push");
        let jsonl = dataset.export(ExportFormat::Jsonl).await.expect("export");
        assert_eq!(jsonl.lines().count(), 2);
    }
}
