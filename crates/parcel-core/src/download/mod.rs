//! Download routing: inline stream, CDN redirect, or manual retrieval.
//!
//! The gateway never fails a download because the backend is momentarily
//! unreachable. The file record still exists, so callers get a
//! [`ManualRetrieval`] describing where it lives instead.
//!
//! Handles that match [`crate::backend::is_backend_handle`] are redirected
//! without a signature. Those handles are issued by the backend, which
//! enforces its own access control on them, so the signature check would add
//! nothing. Note the resolved Bot API URL embeds the bot token; it is handed
//! to the client only through a redirect, never rendered in a body.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use crate::auth::AuthSessionManager;
use crate::backend::{is_backend_handle, BackendError, ByteStream, RemoteBackendClient};
use crate::models::{StorageLocation, StoredFile};
use crate::signing::SignedUrlCodec;
use crate::Result;

/// What the gateway knows about the incoming request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: Option<IpAddr>,
    /// Whether a large-file relay can hand out URLs for files above the threshold.
    pub relay_available: bool,
}

/// Headers and body of a proxied download.
pub struct InlineDownload {
    pub content_type: String,
    pub content_length: u64,
    pub content_disposition: String,
    pub body: ByteStream,
}

impl fmt::Debug for InlineDownload {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("InlineDownload")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("content_disposition", &self.content_disposition)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualReason {
    ExceedsInlineLimit,
    BackendUnavailable,
}

impl ManualReason {
    pub const fn message(self) -> &'static str {
        match self {
            Self::ExceedsInlineLimit => {
                "File is larger than the direct download limit; retrieve it from the storage channel"
            }
            Self::BackendUnavailable => {
                "File is temporarily unretrievable; retrieve it from the storage channel or retry later"
            }
        }
    }
}

/// Structured "fetch it yourself" answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualRetrieval {
    pub file_name: String,
    pub size_bytes: u64,
    pub storage_location: StorageLocation,
    pub message_link: Option<String>,
    pub retrieval_hint: Option<String>,
    pub reason: ManualReason,
    pub message: &'static str,
}

impl ManualRetrieval {
    pub fn for_file(file: &StoredFile, reason: ManualReason) -> Self {
        Self {
            file_name: file.file_name.clone(),
            size_bytes: file.size_bytes,
            storage_location: file.storage_location.clone(),
            message_link: file.storage_location.message_link(),
            retrieval_hint: file.retrieval_hint.clone(),
            reason,
            message: reason.message(),
        }
    }
}

#[derive(Debug)]
pub enum DownloadOutcome {
    Inline(InlineDownload),
    Redirect(String),
    Manual(ManualRetrieval),
}

impl DownloadOutcome {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Inline(_) => "inline",
            Self::Redirect(_) => "redirect",
            Self::Manual(_) => "manual",
        }
    }
}

pub struct DownloadGateway {
    backend: Arc<dyn RemoteBackendClient>,
    codec: Arc<SignedUrlCodec>,
    small_file_threshold: u64,
    bind_client_ip: bool,
    session: Option<Arc<AuthSessionManager>>,
}

impl fmt::Debug for DownloadGateway {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DownloadGateway")
            .field("small_file_threshold", &self.small_file_threshold)
            .field("bind_client_ip", &self.bind_client_ip)
            .finish_non_exhaustive()
    }
}

impl DownloadGateway {
    pub fn new(
        backend: Arc<dyn RemoteBackendClient>,
        codec: Arc<SignedUrlCodec>,
        small_file_threshold: u64,
        bind_client_ip: bool,
    ) -> Self {
        Self {
            backend,
            codec,
            small_file_threshold,
            bind_client_ip,
            session: None,
        }
    }

    /// Reset `session` whenever the relay rejects it during a lookup.
    #[must_use]
    pub fn with_session(mut self, session: Arc<AuthSessionManager>) -> Self {
        self.session = Some(session);
        self
    }

    pub const fn small_file_threshold(&self) -> u64 {
        self.small_file_threshold
    }

    pub const fn binds_client_ip(&self) -> bool {
        self.bind_client_ip
    }

    pub fn codec(&self) -> &SignedUrlCodec {
        &self.codec
    }

    /// Plain download: stream small files, redirect or describe large ones.
    pub async fn serve(&self, file: &StoredFile, context: RequestContext) -> DownloadOutcome {
        if file.size_bytes <= self.small_file_threshold {
            return self.stream_inline(file).await;
        }
        if context.relay_available {
            return self.redirect(file).await;
        }
        tracing::debug!(
            file_handle = %file.file_handle,
            size_bytes = file.size_bytes,
            "File exceeds inline limit and no relay is available"
        );
        DownloadOutcome::Manual(ManualRetrieval::for_file(file, ManualReason::ExceedsInlineLimit))
    }

    /// Check a signed redirect before anything touches the backend.
    ///
    /// The client IP is only part of the signature when IP binding is on.
    pub fn verify_request(
        &self,
        subject_id: &str,
        expires_at_epoch_ms: i64,
        signature_hex: &str,
        context: RequestContext,
    ) -> Result<()> {
        let bound_ip = if self.bind_client_ip { context.client_ip } else { None };
        self.codec
            .check(subject_id, expires_at_epoch_ms, signature_hex, bound_ip)
            .inspect_err(|error| {
                tracing::info!(subject_id, "Signed download refused: {}", error);
            })
    }

    /// Redirect to the backend retrieval URL, never proxying bytes.
    pub async fn redirect(&self, file: &StoredFile) -> DownloadOutcome {
        match self.backend.resolve_retrieval_url(&file.file_handle).await {
            Ok(url) => DownloadOutcome::Redirect(url),
            Err(error) => {
                self.note_rejection(&file.file_handle, &error);
                tracing::warn!(
                    file_handle = %file.file_handle,
                    "Retrieval URL lookup failed, falling back to manual retrieval: {}",
                    error
                );
                DownloadOutcome::Manual(ManualRetrieval::for_file(file, ManualReason::BackendUnavailable))
            }
        }
    }

    /// Direct-handle fast path. Only backend-native handles qualify.
    pub async fn redirect_handle(&self, handle: &str) -> Result<Option<String>> {
        if !is_backend_handle(handle) {
            return Ok(None);
        }
        let url = self.backend.resolve_retrieval_url(handle).await?;
        Ok(Some(url))
    }

    /// Native handles resolve through the bot credential, not the relay session.
    fn note_rejection(&self, file_handle: &str, error: &BackendError) {
        if is_backend_handle(file_handle) {
            return;
        }
        if let (BackendError::Unauthorized(_), Some(session)) = (error, &self.session) {
            session.invalidate("backend rejected the session during a download");
        }
    }

    async fn stream_inline(&self, file: &StoredFile) -> DownloadOutcome {
        let opened = match self.backend.resolve_retrieval_url(&file.file_handle).await {
            Ok(url) => self.backend.open_download(&url).await,
            Err(error) => Err(error),
        };
        match opened {
            Ok(stream) => DownloadOutcome::Inline(InlineDownload {
                content_type: file.mime_type.clone(),
                content_length: stream.content_length.unwrap_or(file.size_bytes),
                content_disposition: content_disposition(&file.file_name),
                body: stream.body,
            }),
            Err(error) => {
                self.note_rejection(&file.file_handle, &error);
                tracing::warn!(
                    file_handle = %file.file_handle,
                    "Inline download failed, falling back to manual retrieval: {}",
                    error
                );
                DownloadOutcome::Manual(ManualRetrieval::for_file(file, ManualReason::BackendUnavailable))
            }
        }
    }
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 `filename*`.
pub fn content_disposition(file_name: &str) -> String {
    let trimmed = file_name.trim();
    let name = if trimmed.is_empty() { "download" } else { trimmed };
    let fallback: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(name)
    )
}
