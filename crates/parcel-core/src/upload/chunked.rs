use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

use super::{UploadSession, UploadState};
use crate::backend::{BackendError, CompositeFileRequest, RemoteBackendClient, SavePartRequest};
use crate::models::{Destination, FileMetadata, StorageLocation, StoredFile};
use crate::util::sanitize;
use crate::{Error, Result};

/// Drives the positional part-upload protocol against the backend.
///
/// Parts go out strictly in order and a failed part ends the session; there
/// is no resume.
#[derive(Clone)]
pub struct ChunkedUploader {
    backend: Arc<dyn RemoteBackendClient>,
}

impl fmt::Debug for ChunkedUploader {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("ChunkedUploader").finish_non_exhaustive()
    }
}

impl ChunkedUploader {
    pub fn new(backend: Arc<dyn RemoteBackendClient>) -> Self {
        Self { backend }
    }

    /// Open a session with a fresh random upload id.
    pub fn begin_upload(&self, total_size_bytes: u64, part_size_bytes: u64) -> Result<UploadSession> {
        let session = UploadSession::new(rand::random(), total_size_bytes, part_size_bytes)?;
        tracing::debug!(
            upload_id = session.upload_id,
            total_parts = session.total_parts,
            size_bytes = total_size_bytes,
            "Chunked upload started"
        );
        Ok(session)
    }

    /// Upload the next part. Any backend failure moves the session to `Failed`.
    pub async fn upload_part(
        &self,
        session: &mut UploadSession,
        part_index: u32,
        bytes: Bytes,
    ) -> Result<()> {
        ensure_open(session)?;
        if session.parts_acknowledged == session.total_parts {
            return Err(Error::InvalidInput(format!(
                "Upload {} already has all {} parts",
                session.upload_id, session.total_parts
            )));
        }
        if part_index != session.parts_acknowledged {
            return Err(Error::PartOutOfOrder {
                upload_id: session.upload_id,
                expected: session.parts_acknowledged,
                actual: part_index,
            });
        }
        let expected_len = session.part_len(part_index);
        if bytes.len() as u64 != expected_len {
            return Err(Error::InvalidInput(format!(
                "Part {part_index} of upload {} must be {expected_len} bytes, got {}",
                session.upload_id,
                bytes.len()
            )));
        }

        session.state = UploadState::PartsUploading;
        let mut regenerated = false;
        loop {
            let request = SavePartRequest {
                upload_id: session.upload_id,
                part_index,
                total_parts: session.total_parts,
                bytes: bytes.clone(),
            };
            match self.backend.upload_part(request).await {
                Ok(()) => break,
                Err(BackendError::UploadIdConflict) if part_index == 0 && !regenerated => {
                    let previous = session.upload_id;
                    session.upload_id = rand::random();
                    regenerated = true;
                    tracing::warn!(
                        previous,
                        upload_id = session.upload_id,
                        "Upload id collided on the backend; retrying with a new id"
                    );
                }
                Err(error) => return Err(fail_part(session, part_index, error)),
            }
        }

        session.parts_acknowledged += 1;
        tracing::trace!(
            upload_id = session.upload_id,
            part_index,
            total_parts = session.total_parts,
            "Part acknowledged"
        );
        Ok(())
    }

    /// Register the composite file once every part is acknowledged.
    pub async fn commit(
        &self,
        session: &mut UploadSession,
        destination: &Destination,
        metadata: &FileMetadata,
    ) -> Result<StoredFile> {
        ensure_open(session)?;
        if !session.is_complete() {
            return Err(Error::CommitIncomplete {
                upload_id: session.upload_id,
                acknowledged: session.parts_acknowledged,
                total: session.total_parts,
            });
        }

        session.state = UploadState::Committing;
        let request = CompositeFileRequest {
            upload_id: session.upload_id,
            total_parts: session.total_parts,
            size_bytes: session.total_size_bytes,
            destination: destination.clone(),
            file_name: metadata.file_name.clone(),
            mime_type: metadata.mime_type.clone(),
        };
        let ack = match self.backend.register_composite_file(request).await {
            Ok(ack) => ack,
            Err(error) => {
                session.state = UploadState::Failed;
                tracing::warn!(
                    upload_id = session.upload_id,
                    "Composite file registration failed: {}",
                    error
                );
                return Err(Error::from(error));
            }
        };

        let Some(file_handle) = ack
            .file_handle
            .map(|handle| handle.trim().to_string())
            .filter(|handle| !handle.is_empty())
        else {
            session.state = UploadState::Failed;
            return Err(Error::BackendRejected(format!(
                "Commit of upload {} returned no file handle",
                session.upload_id
            )));
        };

        session.state = UploadState::Done;
        tracing::info!(
            upload_id = session.upload_id,
            total_parts = session.total_parts,
            size_bytes = session.total_size_bytes,
            "Chunked upload committed"
        );
        Ok(StoredFile {
            file_handle,
            size_bytes: session.total_size_bytes,
            mime_type: metadata.mime_type.clone(),
            file_name: metadata.file_name.clone(),
            storage_location: ack.storage_location.unwrap_or_else(|| StorageLocation {
                channel: destination.as_str().to_string(),
                message_id: None,
            }),
            retrieval_hint: ack.retrieval_hint,
        })
    }

    /// Abandon a session that will not be committed.
    pub fn abort(&self, session: &mut UploadSession) {
        if !session.state.is_terminal() {
            tracing::debug!(
                upload_id = session.upload_id,
                parts_acknowledged = session.parts_acknowledged,
                "Chunked upload abandoned"
            );
            session.state = UploadState::Failed;
        }
    }

    /// Re-chunk a byte stream of known length into parts and commit it.
    pub async fn upload_stream<S, E>(
        &self,
        total_size_bytes: u64,
        part_size_bytes: u64,
        mut body: S,
        destination: &Destination,
        metadata: &FileMetadata,
    ) -> Result<StoredFile>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin + Send,
        E: fmt::Display,
    {
        let mut session = self.begin_upload(total_size_bytes, part_size_bytes)?;
        let mut buffer = BytesMut::new();
        let mut received: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    self.abort(&mut session);
                    return Err(Error::InvalidInput(format!(
                        "Upload body failed after {received} bytes: {}",
                        sanitize(&error)
                    )));
                }
            };
            received += chunk.len() as u64;
            if received > total_size_bytes {
                self.abort(&mut session);
                return Err(Error::InvalidInput(format!(
                    "Upload body exceeds declared size of {total_size_bytes} bytes"
                )));
            }
            buffer.extend_from_slice(&chunk);
            self.flush_full_parts(&mut session, &mut buffer).await?;
        }

        if received != total_size_bytes {
            self.abort(&mut session);
            return Err(Error::InvalidInput(format!(
                "Upload body ended after {received} of {total_size_bytes} bytes"
            )));
        }
        self.commit(&mut session, destination, metadata).await
    }

    async fn flush_full_parts(&self, session: &mut UploadSession, buffer: &mut BytesMut) -> Result<()> {
        while !session.is_complete() {
            let part_index = session.parts_acknowledged;
            let Ok(part_len) = usize::try_from(session.part_len(part_index)) else {
                return Err(Error::InvalidInput("Part size exceeds addressable memory".to_string()));
            };
            if buffer.len() < part_len {
                break;
            }
            let part = buffer.split_to(part_len).freeze();
            self.upload_part(session, part_index, part).await?;
        }
        Ok(())
    }
}

fn ensure_open(session: &UploadSession) -> Result<()> {
    if session.state.is_terminal() {
        return Err(Error::InvalidInput(format!(
            "Upload {} is {}; start a new upload",
            session.upload_id,
            session.state.label()
        )));
    }
    Ok(())
}

fn fail_part(session: &mut UploadSession, part_index: u32, error: BackendError) -> Error {
    session.state = UploadState::Failed;
    tracing::warn!(
        upload_id = session.upload_id,
        part_index,
        total_parts = session.total_parts,
        "Part upload failed: {}",
        error
    );
    match error {
        BackendError::Unauthorized(_) => Error::AuthRequired,
        other => Error::PartUploadFailed {
            upload_id: session.upload_id,
            part_index,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{FakeBackend, RecordedPart};

    const HALF_MIB: u64 = 512 * 1024;

    fn uploader(backend: FakeBackend) -> (ChunkedUploader, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        (ChunkedUploader::new(backend.clone()), backend)
    }

    fn destination() -> Destination {
        Destination::new("-1001234567890")
    }

    fn metadata() -> FileMetadata {
        FileMetadata::new("backup.tar", Some("application/x-tar"))
    }

    fn zeros(len: u64) -> Bytes {
        Bytes::from(vec![0_u8; usize::try_from(len).unwrap()])
    }

    #[tokio::test]
    async fn commit_before_all_parts_is_incomplete() {
        let (uploader, backend) = uploader(FakeBackend::new());
        let mut session = uploader.begin_upload(10_000_000, HALF_MIB).unwrap();
        assert_eq!(session.total_parts(), 20);

        for index in 0..19 {
            let len = session.part_len(index);
            uploader.upload_part(&mut session, index, zeros(len)).await.unwrap();
        }
        let error = uploader
            .commit(&mut session, &destination(), &metadata())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            Error::CommitIncomplete { acknowledged: 19, total: 20, .. }
        ));
        assert!(backend.commits().is_empty());

        let last = zeros(session.part_len(19));
        uploader.upload_part(&mut session, 19, last).await.unwrap();
        let stored = uploader
            .commit(&mut session, &destination(), &metadata())
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, 10_000_000);
        assert_eq!(stored.file_handle, format!("relay-{}", session.upload_id()));
        assert_eq!(session.state(), UploadState::Done);
        assert_eq!(backend.commits()[0].total_parts, 20);
    }

    #[tokio::test]
    async fn parts_must_arrive_in_order() {
        let (uploader, _) = uploader(FakeBackend::new());
        let mut session = uploader.begin_upload(3 * 1024, 1024).unwrap();
        let error = uploader.upload_part(&mut session, 1, zeros(1024)).await.unwrap_err();
        assert!(matches!(error, Error::PartOutOfOrder { expected: 0, actual: 1, .. }));
        assert_eq!(session.state(), UploadState::Idle);
    }

    #[tokio::test]
    async fn rejects_part_of_wrong_length() {
        let (uploader, backend) = uploader(FakeBackend::new());
        let mut session = uploader.begin_upload(3 * 1024, 1024).unwrap();
        let error = uploader.upload_part(&mut session, 0, zeros(1000)).await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert!(backend.parts().is_empty());
    }

    #[tokio::test]
    async fn failed_part_ends_the_session() {
        let (uploader, backend) = uploader(FakeBackend::new().failing_part(1));
        let mut session = uploader.begin_upload(3 * 1024, 1024).unwrap();
        uploader.upload_part(&mut session, 0, zeros(1024)).await.unwrap();

        let error = uploader.upload_part(&mut session, 1, zeros(1024)).await.unwrap_err();
        assert!(matches!(error, Error::PartUploadFailed { part_index: 1, .. }));
        assert_eq!(session.state(), UploadState::Failed);

        // no automatic retry and no resume
        assert_eq!(backend.parts().len(), 1);
        assert!(uploader.upload_part(&mut session, 1, zeros(1024)).await.is_err());
        assert!(uploader
            .commit(&mut session, &destination(), &metadata())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn upload_id_collision_is_retried_once_with_new_id() {
        let (uploader, backend) = uploader(FakeBackend::new().with_upload_id_conflicts(1));
        let mut session = uploader.begin_upload(1024, 1024).unwrap();
        uploader.upload_part(&mut session, 0, zeros(1024)).await.unwrap();

        let parts = backend.parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].upload_id, session.upload_id());
    }

    #[tokio::test]
    async fn repeated_collision_fails_the_upload() {
        let (uploader, _) = uploader(FakeBackend::new().with_upload_id_conflicts(2));
        let mut session = uploader.begin_upload(1024, 1024).unwrap();
        let error = uploader.upload_part(&mut session, 0, zeros(1024)).await.unwrap_err();
        assert!(matches!(error, Error::PartUploadFailed { part_index: 0, .. }));
        assert_eq!(session.state(), UploadState::Failed);
    }

    #[tokio::test]
    async fn unauthorized_part_surfaces_auth_required() {
        let (uploader, _) = uploader(FakeBackend::new().revoked_session());
        let mut session = uploader.begin_upload(1024, 1024).unwrap();
        let error = uploader.upload_part(&mut session, 0, zeros(1024)).await.unwrap_err();
        assert!(matches!(error, Error::AuthRequired));
        assert_eq!(session.state(), UploadState::Failed);
    }

    #[tokio::test]
    async fn commit_without_handle_is_rejected() {
        let (uploader, _) = uploader(FakeBackend::new().without_commit_handle());
        let mut session = uploader.begin_upload(1024, 1024).unwrap();
        uploader.upload_part(&mut session, 0, zeros(1024)).await.unwrap();
        let error = uploader
            .commit(&mut session, &destination(), &metadata())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::BackendRejected(_)));
        assert_eq!(session.state(), UploadState::Failed);
    }

    #[tokio::test]
    async fn stream_is_rechunked_into_exact_parts() {
        let (uploader, backend) = uploader(FakeBackend::new());
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            vec![Ok(zeros(700)), Ok(zeros(700)), Ok(zeros(1100))];
        let stored = uploader
            .upload_stream(2500, 1024, futures::stream::iter(chunks), &destination(), &metadata())
            .await
            .unwrap();

        let parts = backend.parts();
        let upload_id = parts[0].upload_id;
        assert_eq!(
            parts,
            vec![
                RecordedPart { upload_id, part_index: 0, total_parts: 3, len: 1024 },
                RecordedPart { upload_id, part_index: 1, total_parts: 3, len: 1024 },
                RecordedPart { upload_id, part_index: 2, total_parts: 3, len: 452 },
            ]
        );
        assert_eq!(stored.file_name, "backup.tar");
        assert_eq!(stored.storage_location.message_id, Some(900));
    }

    #[tokio::test]
    async fn short_stream_is_not_committed() {
        let (uploader, backend) = uploader(FakeBackend::new());
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![Ok(zeros(1500))];
        let error = uploader
            .upload_stream(2500, 1024, futures::stream::iter(chunks), &destination(), &metadata())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert_eq!(backend.parts().len(), 1);
        assert!(backend.commits().is_empty());
    }

    #[tokio::test]
    async fn oversized_stream_is_refused() {
        let (uploader, backend) = uploader(FakeBackend::new());
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![Ok(zeros(3000))];
        let error = uploader
            .upload_stream(2500, 1024, futures::stream::iter(chunks), &destination(), &metadata())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert!(backend.commits().is_empty());
    }
}
