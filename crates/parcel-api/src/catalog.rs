//! Process-local file catalog.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parcel_core::catalog::{FileCatalog, FileRecord};
use parcel_core::{Error, Result, StoredFile};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Records live for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    records: RwLock<HashMap<String, FileRecord>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under a caller-chosen id.
    #[cfg(test)]
    pub async fn insert(&self, id: &str, stored: StoredFile) -> FileRecord {
        let record = FileRecord {
            id: id.to_string(),
            stored,
            created_at: Utc::now(),
            download_count: 0,
        };
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }
}

#[async_trait]
impl FileCatalog for InMemoryCatalog {
    async fn create_file_record(&self, stored: StoredFile) -> Result<FileRecord> {
        let record = FileRecord {
            id: Uuid::now_v7().to_string(),
            stored,
            created_at: Utc::now(),
            download_count: 0,
        };
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn find_file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        Ok(self.records.read().await.get(file_id).cloned())
    }

    async fn record_download(&self, file_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(file_id)
            .ok_or_else(|| Error::NotFound(format!("File {file_id}")))?;
        record.download_count += 1;
        Ok(())
    }
}
