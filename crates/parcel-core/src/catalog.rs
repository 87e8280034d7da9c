//! Persistence collaborator for file records.
//!
//! The gateway only needs three operations from whatever owns the durable
//! file table; everything else about storage stays outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::StoredFile;
use crate::Result;

/// A persisted upload, addressable by its catalog id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    #[serde(flatten)]
    pub stored: StoredFile,
    pub created_at: DateTime<Utc>,
    pub download_count: u64,
}

#[async_trait]
pub trait FileCatalog: Send + Sync {
    /// Persist a completed upload and return its record.
    async fn create_file_record(&self, stored: StoredFile) -> Result<FileRecord>;

    /// Look up a record by catalog id.
    async fn find_file(&self, file_id: &str) -> Result<Option<FileRecord>>;

    /// Count one download against the record.
    async fn record_download(&self, file_id: &str) -> Result<()>;
}
