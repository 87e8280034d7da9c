//! Upload paths: one-shot for small files, part-by-part through the relay for
//! everything above the small-file threshold.

mod chunked;
mod dispatch;

use serde::Serialize;

pub use chunked::ChunkedUploader;
pub use dispatch::{UploadDispatcher, UploadPath};

use crate::{Error, Result};

/// Lifecycle of one chunked upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    PartsUploading,
    Committing,
    Done,
    Failed,
}

impl UploadState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PartsUploading => "parts_uploading",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// In-memory bookkeeping for a single chunked upload.
///
/// Never persisted; dropping it abandons the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    upload_id: u32,
    total_parts: u32,
    part_size: u64,
    total_size_bytes: u64,
    parts_acknowledged: u32,
    state: UploadState,
}

impl UploadSession {
    fn new(upload_id: u32, total_size_bytes: u64, part_size: u64) -> Result<Self> {
        Ok(Self {
            upload_id,
            total_parts: part_count(total_size_bytes, part_size)?,
            part_size,
            total_size_bytes,
            parts_acknowledged: 0,
            state: UploadState::Idle,
        })
    }

    pub const fn upload_id(&self) -> u32 {
        self.upload_id
    }

    pub const fn total_parts(&self) -> u32 {
        self.total_parts
    }

    pub const fn part_size(&self) -> u64 {
        self.part_size
    }

    pub const fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    pub const fn parts_acknowledged(&self) -> u32 {
        self.parts_acknowledged
    }

    pub const fn state(&self) -> UploadState {
        self.state
    }

    pub const fn is_complete(&self) -> bool {
        self.parts_acknowledged == self.total_parts
    }

    /// Exact byte length part `part_index` must have.
    pub fn part_len(&self, part_index: u32) -> u64 {
        if part_index + 1 < self.total_parts {
            self.part_size
        } else {
            self.total_size_bytes - self.part_size * u64::from(self.total_parts - 1)
        }
    }
}

/// `ceil(total / part_size)`, rejecting empty files and part counts past `u32`.
pub fn part_count(total_size_bytes: u64, part_size: u64) -> Result<u32> {
    if part_size == 0 {
        return Err(Error::InvalidInput("Part size must be positive".to_string()));
    }
    if total_size_bytes == 0 {
        return Err(Error::InvalidInput("Cannot upload an empty file".to_string()));
    }
    u32::try_from(total_size_bytes.div_ceil(part_size)).map_err(|_| {
        Error::InvalidInput(format!(
            "File of {total_size_bytes} bytes needs too many {part_size}-byte parts"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_megabytes_in_half_mebibyte_parts() {
        assert_eq!(part_count(10_000_000, 512 * 1024).unwrap(), 20);
    }

    #[test]
    fn exact_multiple_has_no_trailing_part() {
        assert_eq!(part_count(1024 * 4, 1024).unwrap(), 4);
        assert_eq!(part_count(1, 1024).unwrap(), 1);
    }

    #[test]
    fn rejects_degenerate_sizes() {
        assert!(matches!(part_count(0, 1024), Err(Error::InvalidInput(_))));
        assert!(matches!(part_count(10, 0), Err(Error::InvalidInput(_))));
        assert!(matches!(part_count(u64::MAX, 1), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn last_part_carries_the_remainder() {
        let session = UploadSession::new(7, 10_000_000, 524_288).unwrap();
        assert_eq!(session.part_len(0), 524_288);
        assert_eq!(session.part_len(18), 524_288);
        assert_eq!(session.part_len(19), 10_000_000 - 19 * 524_288);
    }
}
