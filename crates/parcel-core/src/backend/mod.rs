//! Capability seam to the remote messaging backend.
//!
//! The core never talks to the backend directly; it goes through
//! [`RemoteBackendClient`], which has a production implementation over HTTP
//! ([`HttpBackend`]) and a scripted fake for tests.

mod bot_api;
mod envelope;
mod relay;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AuthorizedIdentity, Destination, FileMetadata, StorageLocation, StoredFile};

pub use bot_api::{BotApiClient, BotApiConfig};
pub use relay::{RelayBridgeClient, RelayBridgeConfig};

/// Prefixes of backend-native file handles that carry their own access control.
///
/// These cover the document, video, photo, audio, voice, video-note and
/// sticker handle families issued by the Bot API.
pub const BACKEND_HANDLE_PREFIXES: &[&str] = &["BQAC", "BAAC", "AgAC", "CQAC", "AwAC", "DQAC", "CAAC"];

/// Whether `candidate` looks like a backend-native file handle.
pub fn is_backend_handle(candidate: &str) -> bool {
    candidate.len() > 16
        && BACKEND_HANDLE_PREFIXES
            .iter()
            .any(|prefix| candidate.starts_with(prefix))
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Failures reported by a backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend rejected request: {0}")]
    Rejected(String),
    #[error("Backend session unauthorized: {0}")]
    Unauthorized(String),
    #[error("Upload identifier collides with an existing session")]
    UploadIdConflict,
    #[error("Account requires a second-factor password")]
    PasswordRequired,
    #[error("Login code is invalid or expired")]
    InvalidCode,
}

pub type BackendResult<T> = Result<T, BackendError>;

pub type ByteStream = BoxStream<'static, BackendResult<Bytes>>;

/// Single-call upload of a file under the small-file threshold.
#[derive(Debug, Clone)]
pub struct SmallUploadRequest {
    pub destination: Destination,
    pub metadata: FileMetadata,
    pub bytes: Bytes,
}

/// One positional part of a chunked upload.
#[derive(Debug, Clone)]
pub struct SavePartRequest {
    pub upload_id: u32,
    pub part_index: u32,
    pub total_parts: u32,
    pub bytes: Bytes,
}

/// Final call that turns acknowledged parts into one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeFileRequest {
    pub upload_id: u32,
    pub total_parts: u32,
    pub size_bytes: u64,
    pub destination: Destination,
    pub file_name: String,
    pub mime_type: String,
}

/// Backend acknowledgement of a composite file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeFileAck {
    #[serde(default)]
    pub file_handle: Option<String>,
    #[serde(default)]
    pub storage_location: Option<StorageLocation>,
    #[serde(default)]
    pub retrieval_hint: Option<String>,
}

/// Result of dispatching a login code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentCode {
    pub phone_code_hash: String,
}

/// An open byte stream from a retrieval URL.
pub struct DownloadStream {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for DownloadStream {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DownloadStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Narrow set of backend operations the core depends on.
#[async_trait]
pub trait RemoteBackendClient: Send + Sync {
    /// Post a small file in one call and return its stored handle.
    async fn upload_small(&self, request: SmallUploadRequest) -> BackendResult<StoredFile>;

    /// Upload one part of a chunked session.
    async fn upload_part(&self, request: SavePartRequest) -> BackendResult<()>;

    /// Register the composite file built from all acknowledged parts.
    async fn register_composite_file(
        &self,
        request: CompositeFileRequest,
    ) -> BackendResult<CompositeFileAck>;

    /// Temporary URL the stored file can be fetched from.
    async fn resolve_retrieval_url(&self, file_handle: &str) -> BackendResult<String>;

    /// Open a byte stream for a previously resolved retrieval URL.
    async fn open_download(&self, url: &str) -> BackendResult<DownloadStream>;

    /// Dispatch a login code to `phone_number`.
    async fn send_code(&self, phone_number: &str) -> BackendResult<SentCode>;

    /// Complete the login with the received code.
    async fn verify_code(
        &self,
        phone_number: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> BackendResult<AuthorizedIdentity>;

    /// Identity of an already authorized session, if any.
    async fn current_identity(&self) -> BackendResult<Option<AuthorizedIdentity>>;
}

/// Production backend: Bot API for small files, relay bridge for the rest.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    bot: BotApiClient,
    relay: Option<RelayBridgeClient>,
}

impl HttpBackend {
    pub const fn new(bot: BotApiClient, relay: Option<RelayBridgeClient>) -> Self {
        Self { bot, relay }
    }

    pub const fn relay(&self) -> Option<&RelayBridgeClient> {
        self.relay.as_ref()
    }

    fn require_relay(&self) -> BackendResult<&RelayBridgeClient> {
        self.relay.as_ref().ok_or_else(|| {
            BackendError::Unavailable("large-file relay bridge is not configured".to_string())
        })
    }
}

#[async_trait]
impl RemoteBackendClient for HttpBackend {
    async fn upload_small(&self, request: SmallUploadRequest) -> BackendResult<StoredFile> {
        self.bot.send_document(request).await
    }

    async fn upload_part(&self, request: SavePartRequest) -> BackendResult<()> {
        self.require_relay()?.save_part(request).await
    }

    async fn register_composite_file(
        &self,
        request: CompositeFileRequest,
    ) -> BackendResult<CompositeFileAck> {
        self.require_relay()?.commit(&request).await
    }

    async fn resolve_retrieval_url(&self, file_handle: &str) -> BackendResult<String> {
        if is_backend_handle(file_handle) {
            return self.bot.file_url(file_handle).await;
        }
        self.require_relay()?.file_url(file_handle).await
    }

    async fn open_download(&self, url: &str) -> BackendResult<DownloadStream> {
        self.bot.open_download(url).await
    }

    async fn send_code(&self, phone_number: &str) -> BackendResult<SentCode> {
        self.require_relay()?.send_code(phone_number).await
    }

    async fn verify_code(
        &self,
        phone_number: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> BackendResult<AuthorizedIdentity> {
        self.require_relay()?
            .sign_in(phone_number, phone_code_hash, code)
            .await
    }

    async fn current_identity(&self) -> BackendResult<Option<AuthorizedIdentity>> {
        match self.relay.as_ref() {
            Some(relay) => relay.me().await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_bot_api_handles() {
        assert!(is_backend_handle("BQACAgIAAxkBAAIBZ2Xx-abc_def"));
        assert!(is_backend_handle("AgACAgQAAxkDAAMEZabcdefghij"));
    }

    #[test]
    fn rejects_short_or_foreign_handles() {
        assert!(!is_backend_handle("BQAC"));
        assert!(!is_backend_handle("0190c3f6-9a7e-7c1d-8f0e-5a6b7c8d9e0f"));
        assert!(!is_backend_handle("XXXXAgIAAxkBAAIBZ2Xxabcdef"));
        assert!(!is_backend_handle("BQACAgIAAxkBAAIB/../../etc"));
    }
}
