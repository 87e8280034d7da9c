use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Serialize;

use super::ChunkedUploader;
use crate::auth::AuthSessionManager;
use crate::backend::{BackendError, RemoteBackendClient, SmallUploadRequest};
use crate::models::{Destination, FileMetadata, StoredFile};
use crate::util::sanitize;
use crate::{Error, Result};

/// Which backend path an upload of a given size takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPath {
    Small,
    Chunked,
}

impl UploadPath {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Chunked => "chunked",
        }
    }
}

/// Routes uploads to the one-shot path or the relay, gated on the auth session.
pub struct UploadDispatcher {
    backend: Arc<dyn RemoteBackendClient>,
    auth: Arc<AuthSessionManager>,
    uploader: ChunkedUploader,
    small_file_threshold: u64,
    part_size: u64,
}

impl fmt::Debug for UploadDispatcher {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("UploadDispatcher")
            .field("small_file_threshold", &self.small_file_threshold)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

impl UploadDispatcher {
    pub fn new(
        backend: Arc<dyn RemoteBackendClient>,
        auth: Arc<AuthSessionManager>,
        small_file_threshold: u64,
        part_size: u64,
    ) -> Result<Self> {
        if part_size == 0 {
            return Err(Error::InvalidInput("Part size must be positive".to_string()));
        }
        Ok(Self {
            uploader: ChunkedUploader::new(backend.clone()),
            backend,
            auth,
            small_file_threshold,
            part_size,
        })
    }

    pub const fn path_for(&self, size_bytes: u64) -> UploadPath {
        if size_bytes <= self.small_file_threshold {
            UploadPath::Small
        } else {
            UploadPath::Chunked
        }
    }

    /// Upload a body of known length, streaming it through the relay when large.
    pub async fn upload_stream<S, E>(
        &self,
        destination: &Destination,
        metadata: &FileMetadata,
        size_bytes: u64,
        body: S,
    ) -> Result<StoredFile>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin + Send,
        E: fmt::Display,
    {
        if size_bytes == 0 {
            return Err(Error::InvalidInput("Cannot upload an empty file".to_string()));
        }
        match self.path_for(size_bytes) {
            UploadPath::Small => {
                let bytes = collect_body(body, size_bytes).await?;
                self.upload_small(destination, metadata, bytes).await
            }
            UploadPath::Chunked => {
                self.auth.require_authorized()?;
                let result = self
                    .uploader
                    .upload_stream(size_bytes, self.part_size, body, destination, metadata)
                    .await;
                self.settle_chunked(result)
            }
        }
    }

    async fn upload_small(
        &self,
        destination: &Destination,
        metadata: &FileMetadata,
        bytes: Bytes,
    ) -> Result<StoredFile> {
        let size_bytes = bytes.len();
        let request = SmallUploadRequest {
            destination: destination.clone(),
            metadata: metadata.clone(),
            bytes,
        };
        let stored = self.backend.upload_small(request).await.map_err(|error| {
            tracing::warn!(size_bytes, "Small-file upload failed: {}", error);
            match error {
                // bot credential problem, not the relay session
                BackendError::Unauthorized(reason) => Error::BackendRejected(reason),
                other => Error::from(other),
            }
        })?;
        tracing::info!(
            file_handle = %stored.file_handle,
            size_bytes,
            "Small-file upload stored"
        );
        Ok(stored)
    }

    fn settle_chunked(&self, result: Result<StoredFile>) -> Result<StoredFile> {
        if matches!(result, Err(Error::AuthRequired)) {
            self.auth
                .invalidate("backend rejected the session during a chunked upload");
        }
        result
    }
}

async fn collect_body<S, E>(mut body: S, size_bytes: u64) -> Result<Bytes>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin + Send,
    E: fmt::Display,
{
    let mut buffer = BytesMut::with_capacity(usize::try_from(size_bytes).unwrap_or(0));
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|error| {
            Error::InvalidInput(format!("Upload body failed: {}", sanitize(&error)))
        })?;
        buffer.extend_from_slice(&chunk);
        if buffer.len() as u64 > size_bytes {
            return Err(Error::InvalidInput(format!(
                "Upload body exceeds declared size of {size_bytes} bytes"
            )));
        }
    }
    if buffer.len() as u64 != size_bytes {
        return Err(Error::InvalidInput(format!(
            "Upload body ended after {} of {size_bytes} bytes",
            buffer.len()
        )));
    }
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::auth::AuthState;
    use crate::testing::FakeBackend;

    const THRESHOLD: u64 = 4096;

    async fn dispatcher(backend: FakeBackend) -> (UploadDispatcher, Arc<AuthSessionManager>, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let auth = Arc::new(AuthSessionManager::new(backend.clone()));
        auth.check_existing().await.unwrap();
        let dispatcher = UploadDispatcher::new(backend.clone(), auth.clone(), THRESHOLD, 1024).unwrap();
        (dispatcher, auth, backend)
    }

    fn payload(len: u64) -> Bytes {
        Bytes::from(vec![7_u8; usize::try_from(len).unwrap()])
    }

    async fn upload(dispatcher: &UploadDispatcher, bytes: Bytes) -> Result<StoredFile> {
        let (destination, metadata) = target();
        let size_bytes = bytes.len() as u64;
        let body = futures::stream::iter([Ok::<_, std::convert::Infallible>(bytes)]);
        dispatcher.upload_stream(&destination, &metadata, size_bytes, body).await
    }

    fn target() -> (Destination, FileMetadata) {
        (
            Destination::new("@parcel_store"),
            FileMetadata::new("notes.txt", Some("text/plain")),
        )
    }

    #[tokio::test]
    async fn threshold_sized_file_takes_small_path() {
        let (dispatcher, _, backend) = dispatcher(FakeBackend::new()).await;
        assert_eq!(dispatcher.path_for(THRESHOLD), UploadPath::Small);
        assert_eq!(dispatcher.path_for(THRESHOLD + 1), UploadPath::Chunked);

        let stored = upload(&dispatcher, payload(THRESHOLD)).await.unwrap();
        assert_eq!(stored.size_bytes, THRESHOLD);
        assert_eq!(backend.small_upload_count(), 1);
        assert!(backend.parts().is_empty());
    }

    #[tokio::test]
    async fn large_file_requires_authorized_session() {
        let (dispatcher, _, backend) = dispatcher(FakeBackend::new()).await;
        let error = upload(&dispatcher, payload(THRESHOLD + 1)).await.unwrap_err();
        assert!(matches!(error, Error::AuthRequired));
        assert!(backend.parts().is_empty());
        assert_eq!(backend.small_upload_count(), 0);
    }

    #[tokio::test]
    async fn large_file_goes_through_relay_when_authorized() {
        let (dispatcher, _, backend) = dispatcher(FakeBackend::new().with_identity()).await;
        let stored = upload(&dispatcher, payload(THRESHOLD + 1)).await.unwrap();
        assert_eq!(stored.size_bytes, THRESHOLD + 1);
        assert_eq!(backend.parts().len(), 5);
        assert_eq!(backend.commits().len(), 1);
    }

    #[tokio::test]
    async fn backend_rejecting_session_invalidates_it() {
        let (dispatcher, auth, _) =
            dispatcher(FakeBackend::new().with_identity().revoked_session()).await;
        let error = upload(&dispatcher, payload(THRESHOLD * 2)).await.unwrap_err();
        assert!(matches!(error, Error::AuthRequired));
        assert_eq!(auth.snapshot().state, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let (dispatcher, _, backend) = dispatcher(FakeBackend::new()).await;
        let error = upload(&dispatcher, Bytes::new()).await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert_eq!(backend.small_upload_count(), 0);
    }
}
