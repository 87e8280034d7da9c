//! Bot API client: single-call uploads and retrieval of small files.

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{envelope, BackendError, BackendResult, DownloadStream, SmallUploadRequest};
use crate::models::{StorageLocation, StoredFile};
use crate::util::{is_http_url, sanitize};
use crate::{Error, Result};

#[derive(Clone)]
pub struct BotApiConfig {
    pub api_url: String,
    pub bot_token: String,
    pub timeout: Duration,
}

impl fmt::Debug for BotApiConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BotApiConfig")
            .field("api_url", &self.api_url)
            .field("bot_token", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct BotApiClient {
    client: reqwest::Client,
    api_url: String,
    bot_token: String,
    timeout: Duration,
}

impl fmt::Debug for BotApiClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BotApiClient")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl BotApiClient {
    pub fn new(config: BotApiConfig) -> Result<Self> {
        let api_url = config.api_url.trim().trim_end_matches('/').to_string();
        if !is_http_url(&api_url) {
            return Err(Error::InvalidInput(
                "Bot API URL must start with http:// or https://".to_string(),
            ));
        }
        if config.bot_token.trim().is_empty() {
            return Err(Error::InvalidInput("Bot token must not be empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|error| {
                Error::InvalidInput(format!("Failed to construct HTTP client: {}", sanitize(&error)))
            })?;
        Ok(Self {
            client,
            api_url,
            bot_token: config.bot_token.trim().to_string(),
            timeout: config.timeout,
        })
    }

    pub(super) async fn send_document(&self, request: SmallUploadRequest) -> BackendResult<StoredFile> {
        let uploaded_len = request.bytes.len() as u64;
        let part = Part::bytes(request.bytes.to_vec())
            .file_name(request.metadata.file_name.clone())
            .mime_str(&request.metadata.mime_type)
            .map_err(|error| {
                BackendError::Rejected(format!("Invalid MIME type: {}", sanitize(&error)))
            })?;
        let form = Form::new()
            .text("chat_id", request.destination.0.clone())
            .text("disable_content_type_detection", "true")
            .part("document", part);

        let response = self
            .client
            .post(self.method_url("sendDocument"))
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|error| envelope::transport("sendDocument", error))?;
        let message: BotMessage = envelope::decode("sendDocument", response).await?;

        let document = message.document.ok_or_else(|| {
            BackendError::Rejected("sendDocument returned a message without a document".to_string())
        })?;
        let storage_location = StorageLocation {
            channel: message.chat.reference(),
            message_id: Some(message.message_id),
        };
        Ok(StoredFile {
            file_handle: document.file_id,
            size_bytes: document.file_size.unwrap_or(uploaded_len),
            mime_type: document.mime_type.unwrap_or(request.metadata.mime_type),
            file_name: document.file_name.unwrap_or(request.metadata.file_name),
            retrieval_hint: storage_location.message_link(),
            storage_location,
        })
    }

    pub(super) async fn file_url(&self, file_handle: &str) -> BackendResult<String> {
        let response = self
            .client
            .get(self.method_url("getFile"))
            .timeout(self.timeout)
            .query(&[("file_id", file_handle)])
            .send()
            .await
            .map_err(|error| envelope::transport("getFile", error))?;
        let file: BotFile = envelope::decode("getFile", response).await?;
        let path = file
            .file_path
            .filter(|path| !path.trim().is_empty())
            .ok_or_else(|| {
                BackendError::Rejected("getFile returned no downloadable path".to_string())
            })?;
        Ok(format!("{}/file/bot{}/{}", self.api_url, self.bot_token, path))
    }

    pub(super) async fn open_download(&self, url: &str) -> BackendResult<DownloadStream> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| envelope::transport("download", error))?;
        if !response.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "download failed with HTTP {}",
                response.status().as_u16()
            )));
        }
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|error| envelope::transport("download", error)))
            .boxed();
        Ok(DownloadStream {
            content_length,
            body,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_url, self.bot_token)
    }
}

#[derive(Debug, Deserialize)]
struct BotMessage {
    message_id: i64,
    chat: BotChat,
    document: Option<BotDocument>,
}

#[derive(Debug, Deserialize)]
struct BotChat {
    id: i64,
    username: Option<String>,
}

impl BotChat {
    fn reference(&self) -> String {
        self.username
            .as_deref()
            .filter(|name| !name.is_empty())
            .map_or_else(|| self.id.to_string(), |name| format!("@{name}"))
    }
}

#[derive(Debug, Deserialize)]
struct BotDocument {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotFile {
    file_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_url: &str, token: &str) -> BotApiConfig {
        BotApiConfig {
            api_url: api_url.to_string(),
            bot_token: token.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn new_rejects_non_http_url_and_blank_token() {
        assert!(BotApiClient::new(config("ftp://api", "123:abc")).is_err());
        assert!(BotApiClient::new(config("https://api.example.com", "  ")).is_err());
    }

    #[test]
    fn method_url_strips_trailing_slash() {
        let client = BotApiClient::new(config("https://api.example.com/", "123:abc")).unwrap();
        assert_eq!(
            client.method_url("getFile"),
            "https://api.example.com/bot123:abc/getFile"
        );
    }

    #[test]
    fn debug_output_hides_token() {
        let client = BotApiClient::new(config("https://api.example.com", "123:secret")).unwrap();
        assert!(!format!("{client:?}").contains("secret"));
        assert!(!format!("{:?}", config("https://a", "123:secret")).contains("secret"));
    }

    #[test]
    fn chat_reference_prefers_username() {
        let public = BotChat {
            id: -100_42,
            username: Some("store".to_string()),
        };
        let private = BotChat {
            id: -1_001_234,
            username: None,
        };
        assert_eq!(public.reference(), "@store");
        assert_eq!(private.reference(), "-1001234");
    }
}
