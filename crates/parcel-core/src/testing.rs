//! Deterministic stand-ins for the backend and the wall clock.
//!
//! Compiled for this crate's tests and, through the `test-support` feature,
//! for downstream crates' tests.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::backend::{
    is_backend_handle, BackendError, BackendResult, CompositeFileAck, CompositeFileRequest,
    DownloadStream, RemoteBackendClient, SavePartRequest, SentCode, SmallUploadRequest,
};
use crate::models::{AuthorizedIdentity, StorageLocation, StoredFile};
use crate::signing::Clock;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub const fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_millis(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Identity the fake reports once signed in.
pub fn fake_identity() -> AuthorizedIdentity {
    AuthorizedIdentity {
        user_id: 4242,
        display_name: "Relay Account".to_string(),
        username: Some("relay_account".to_string()),
    }
}

/// A part the fake backend accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPart {
    pub upload_id: u32,
    pub part_index: u32,
    pub total_parts: u32,
    pub len: usize,
}

#[derive(Default)]
struct FakeState {
    authorized: bool,
    sign_in_attempts: Vec<(String, String, String)>,
    parts: Vec<RecordedPart>,
    commits: Vec<CompositeFileRequest>,
    small_uploads: Vec<SmallUploadRequest>,
    resolved: Vec<String>,
    downloads: Vec<String>,
}

/// Scripted in-memory [`RemoteBackendClient`].
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    codes_sent: AtomicU32,
    conflicts_remaining: AtomicU32,
    require_password: bool,
    reject_codes: bool,
    fail_part: Option<u32>,
    revoked_session: bool,
    omit_commit_handle: bool,
    fail_resolve: bool,
    revoked_bot_token: bool,
    sign_in_delay: Option<Duration>,
    download_body: Vec<u8>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an already authorized session.
    #[must_use]
    pub fn with_identity(self) -> Self {
        self.lock().authorized = true;
        self
    }

    #[must_use]
    pub const fn requiring_password(mut self) -> Self {
        self.require_password = true;
        self
    }

    #[must_use]
    pub const fn rejecting_codes(mut self) -> Self {
        self.reject_codes = true;
        self
    }

    /// Fail the upload of `part_index` with a transport error.
    #[must_use]
    pub const fn failing_part(mut self, part_index: u32) -> Self {
        self.fail_part = Some(part_index);
        self
    }

    /// Answer the first `times` part uploads with an upload-id collision.
    #[must_use]
    pub fn with_upload_id_conflicts(self, times: u32) -> Self {
        self.conflicts_remaining.store(times, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub const fn revoked_session(mut self) -> Self {
        self.revoked_session = true;
        self
    }

    #[must_use]
    pub const fn without_commit_handle(mut self) -> Self {
        self.omit_commit_handle = true;
        self
    }

    #[must_use]
    pub const fn failing_resolve(mut self) -> Self {
        self.fail_resolve = true;
        self
    }

    /// Hold every sign-in for `delay` after it is recorded.
    #[must_use]
    pub const fn with_sign_in_delay(mut self, delay: Duration) -> Self {
        self.sign_in_delay = Some(delay);
        self
    }

    /// Native handles fail as if the bot token were revoked.
    #[must_use]
    pub const fn revoked_bot_token(mut self) -> Self {
        self.revoked_bot_token = true;
        self
    }

    #[must_use]
    pub fn with_download_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.download_body = body.into();
        self
    }

    pub fn sign_in_attempts(&self) -> Vec<(String, String, String)> {
        self.lock().sign_in_attempts.clone()
    }

    pub fn parts(&self) -> Vec<RecordedPart> {
        self.lock().parts.clone()
    }

    pub fn commits(&self) -> Vec<CompositeFileRequest> {
        self.lock().commits.clone()
    }

    pub fn small_upload_count(&self) -> usize {
        self.lock().small_uploads.len()
    }

    pub fn resolved_handles(&self) -> Vec<String> {
        self.lock().resolved.clone()
    }

    pub fn opened_downloads(&self) -> Vec<String> {
        self.lock().downloads.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteBackendClient for FakeBackend {
    async fn upload_small(&self, request: SmallUploadRequest) -> BackendResult<StoredFile> {
        let mut state = self.lock();
        let index = state.small_uploads.len();
        let stored = StoredFile {
            file_handle: format!("BQACAgIAAxkBAAIBfake{index:04}"),
            size_bytes: request.bytes.len() as u64,
            mime_type: request.metadata.mime_type.clone(),
            file_name: request.metadata.file_name.clone(),
            storage_location: StorageLocation {
                channel: request.destination.0.clone(),
                message_id: Some(100 + i64::try_from(index).unwrap_or(0)),
            },
            retrieval_hint: None,
        };
        state.small_uploads.push(request);
        Ok(stored)
    }

    async fn upload_part(&self, request: SavePartRequest) -> BackendResult<()> {
        if self.revoked_session {
            return Err(BackendError::Unauthorized("AUTH_KEY_UNREGISTERED".to_string()));
        }
        if self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::UploadIdConflict);
        }
        if self.fail_part == Some(request.part_index) {
            return Err(BackendError::Unavailable("connection reset".to_string()));
        }
        self.lock().parts.push(RecordedPart {
            upload_id: request.upload_id,
            part_index: request.part_index,
            total_parts: request.total_parts,
            len: request.bytes.len(),
        });
        Ok(())
    }

    async fn register_composite_file(
        &self,
        request: CompositeFileRequest,
    ) -> BackendResult<CompositeFileAck> {
        let ack = if self.omit_commit_handle {
            CompositeFileAck::default()
        } else {
            CompositeFileAck {
                file_handle: Some(format!("relay-{}", request.upload_id)),
                storage_location: Some(StorageLocation {
                    channel: request.destination.0.clone(),
                    message_id: Some(900),
                }),
                retrieval_hint: None,
            }
        };
        self.lock().commits.push(request);
        Ok(ack)
    }

    async fn resolve_retrieval_url(&self, file_handle: &str) -> BackendResult<String> {
        self.lock().resolved.push(file_handle.to_string());
        if self.fail_resolve {
            return Err(BackendError::Unavailable("timed out".to_string()));
        }
        if self.revoked_session && !is_backend_handle(file_handle) {
            return Err(BackendError::Unauthorized("AUTH_KEY_UNREGISTERED".to_string()));
        }
        if self.revoked_bot_token && is_backend_handle(file_handle) {
            return Err(BackendError::Unauthorized("getFile: Unauthorized".to_string()));
        }
        Ok(format!("https://cdn.example.test/{file_handle}"))
    }

    async fn open_download(&self, url: &str) -> BackendResult<DownloadStream> {
        self.lock().downloads.push(url.to_string());
        let body = self.download_body.clone();
        let content_length = Some(body.len() as u64);
        let chunks: Vec<BackendResult<Bytes>> = body
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(DownloadStream {
            content_length,
            body: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn send_code(&self, _phone_number: &str) -> BackendResult<SentCode> {
        let sent = self.codes_sent.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;
        Ok(SentCode {
            phone_code_hash: format!("hash-{sent}"),
        })
    }

    async fn verify_code(
        &self,
        phone_number: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> BackendResult<AuthorizedIdentity> {
        self.lock().sign_in_attempts.push((
            phone_number.to_string(),
            phone_code_hash.to_string(),
            code.to_string(),
        ));
        if let Some(delay) = self.sign_in_delay {
            tokio::time::sleep(delay).await;
        }
        if self.require_password {
            return Err(BackendError::PasswordRequired);
        }
        if self.reject_codes {
            return Err(BackendError::InvalidCode);
        }
        self.lock().authorized = true;
        Ok(fake_identity())
    }

    async fn current_identity(&self) -> BackendResult<Option<AuthorizedIdentity>> {
        Ok(self.lock().authorized.then(fake_identity))
    }
}
