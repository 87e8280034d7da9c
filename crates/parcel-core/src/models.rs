//! Data types shared between the upload and download paths.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A completed upload as the backend reports it.
///
/// Created once per successful upload and never mutated afterwards; the file
/// catalog owns the durable copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub file_handle: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub file_name: String,
    pub storage_location: StorageLocation,
    #[serde(default)]
    pub retrieval_hint: Option<String>,
}

/// Where a stored file lives on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageLocation {
    pub channel: String,
    #[serde(default)]
    pub message_id: Option<i64>,
}

impl StorageLocation {
    /// Public link to the message carrying the file, when one can be derived.
    ///
    /// Private channels (`-100…` ids) map to `t.me/c/<id>/<msg>`, public ones
    /// (`@name`) to `t.me/<name>/<msg>`.
    pub fn message_link(&self) -> Option<String> {
        let message_id = self.message_id?;
        let channel = self.channel.trim();
        if let Some(private_id) = channel.strip_prefix("-100") {
            if !private_id.is_empty() && private_id.chars().all(|c| c.is_ascii_digit()) {
                return Some(format!("https://t.me/c/{private_id}/{message_id}"));
            }
            return None;
        }
        channel
            .strip_prefix('@')
            .filter(|name| !name.is_empty())
            .map(|name| format!("https://t.me/{name}/{message_id}"))
    }
}

/// Channel a new upload is posted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination(pub String);

impl Destination {
    pub fn new(channel: impl Into<String>) -> Self {
        Self(channel.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Caller-supplied description of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,
    pub mime_type: String,
}

impl FileMetadata {
    pub fn new(file_name: impl Into<String>, mime_type: Option<&str>) -> Self {
        let mime_type = mime_type
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("application/octet-stream");
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.to_string(),
        }
    }
}

/// Account the relay session is signed in as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedIdentity {
    pub user_id: i64,
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(channel: &str, message_id: Option<i64>) -> StorageLocation {
        StorageLocation {
            channel: channel.to_string(),
            message_id,
        }
    }

    #[test]
    fn message_link_for_private_channel() {
        assert_eq!(
            location("-1001234567", Some(42)).message_link().as_deref(),
            Some("https://t.me/c/1234567/42")
        );
    }

    #[test]
    fn message_link_for_public_channel() {
        assert_eq!(
            location("@parcel_store", Some(7)).message_link().as_deref(),
            Some("https://t.me/parcel_store/7")
        );
    }

    #[test]
    fn message_link_requires_message_id_and_known_shape() {
        assert_eq!(location("@parcel_store", None).message_link(), None);
        assert_eq!(location("12345", Some(1)).message_link(), None);
        assert_eq!(location("-100abc", Some(1)).message_link(), None);
    }

    #[test]
    fn metadata_defaults_blank_mime_type() {
        let metadata = FileMetadata::new("a.bin", Some("  "));
        assert_eq!(metadata.mime_type, "application/octet-stream");
    }
}
