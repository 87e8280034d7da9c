//! Relay bridge client: the user-session path used for chunked uploads,
//! large-file retrieval, the login handshake, and the update feed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;

use super::{envelope, BackendResult, CompositeFileAck, CompositeFileRequest, SavePartRequest, SentCode};
use crate::events::{UpdateBatch, UpdateSource};
use crate::models::AuthorizedIdentity;
use crate::util::{is_http_url, sanitize};
use crate::{Error, Result};

#[derive(Clone)]
pub struct RelayBridgeConfig {
    pub base_url: String,
    pub access_token: String,
    pub timeout: Duration,
}

impl fmt::Debug for RelayBridgeConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RelayBridgeConfig")
            .field("base_url", &self.base_url)
            .field("access_token", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct RelayBridgeClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    timeout: Duration,
}

impl fmt::Debug for RelayBridgeClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RelayBridgeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RelayBridgeClient {
    pub fn new(config: RelayBridgeConfig) -> Result<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(Error::InvalidInput(
                "Relay bridge URL must start with http:// or https://".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|error| {
                Error::InvalidInput(format!("Failed to construct HTTP client: {}", sanitize(&error)))
            })?;
        Ok(Self {
            client,
            base_url,
            access_token: config.access_token,
            timeout: config.timeout,
        })
    }

    pub(super) async fn save_part(&self, request: SavePartRequest) -> BackendResult<()> {
        let response = self
            .authorized(self.client.post(self.url("/upload/part")))
            .query(&[
                ("upload_id", request.upload_id),
                ("part_index", request.part_index),
                ("total_parts", request.total_parts),
            ])
            .header("Content-Type", "application/octet-stream")
            .body(request.bytes)
            .send()
            .await
            .map_err(|error| envelope::transport("save_part", error))?;
        let _: bool = envelope::decode("save_part", response).await?;
        Ok(())
    }

    pub(super) async fn commit(&self, request: &CompositeFileRequest) -> BackendResult<CompositeFileAck> {
        let response = self
            .authorized(self.client.post(self.url("/upload/commit")))
            .json(request)
            .send()
            .await
            .map_err(|error| envelope::transport("commit", error))?;
        envelope::decode("commit", response).await
    }

    pub(super) async fn file_url(&self, file_handle: &str) -> BackendResult<String> {
        let response = self
            .authorized(self.client.get(self.url("/files/url")))
            .query(&[("handle", file_handle)])
            .send()
            .await
            .map_err(|error| envelope::transport("file_url", error))?;
        let payload: FileUrlPayload = envelope::decode("file_url", response).await?;
        Ok(payload.url)
    }

    pub(super) async fn send_code(&self, phone_number: &str) -> BackendResult<SentCode> {
        let response = self
            .authorized(self.client.post(self.url("/auth/send-code")))
            .json(&serde_json::json!({ "phoneNumber": phone_number }))
            .send()
            .await
            .map_err(|error| envelope::transport("send_code", error))?;
        envelope::decode("send_code", response).await
    }

    pub(super) async fn sign_in(
        &self,
        phone_number: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> BackendResult<AuthorizedIdentity> {
        let response = self
            .authorized(self.client.post(self.url("/auth/sign-in")))
            .json(&serde_json::json!({
                "phoneNumber": phone_number,
                "phoneCodeHash": phone_code_hash,
                "code": code.trim(),
            }))
            .send()
            .await
            .map_err(|error| envelope::transport("sign_in", error))?;
        envelope::decode("sign_in", response).await
    }

    pub(super) async fn me(&self) -> BackendResult<Option<AuthorizedIdentity>> {
        let response = self
            .authorized(self.client.get(self.url("/auth/me")))
            .send()
            .await
            .map_err(|error| envelope::transport("me", error))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        envelope::decode("me", response).await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .timeout(self.timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl UpdateSource for RelayBridgeClient {
    async fn next_batch(&self, offset: i64, wait: Duration) -> BackendResult<UpdateBatch> {
        let response = self
            .client
            .get(self.url("/updates"))
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .timeout(self.timeout + wait)
            .query(&[("offset", offset), ("timeout", i64::try_from(wait.as_secs()).unwrap_or(0))])
            .send()
            .await
            .map_err(|error| envelope::transport("updates", error))?;
        envelope::decode("updates", response).await
    }
}

#[derive(Debug, Deserialize)]
struct FileUrlPayload {
    url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_requires_http_base() {
        let config = RelayBridgeConfig {
            base_url: "relay.internal".to_string(),
            access_token: "token".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(RelayBridgeClient::new(config).is_err());
    }

    #[test]
    fn url_joins_without_double_slash() {
        let client = RelayBridgeClient::new(RelayBridgeConfig {
            base_url: "http://relay.internal:9000/".to_string(),
            access_token: "token".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(client.url("/upload/part"), "http://relay.internal:9000/upload/part");
    }
}
