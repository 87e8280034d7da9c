//! `{ ok, result, description, error_code }` response envelope shared by the
//! Bot API and the relay bridge.

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{BackendError, BackendResult};
use crate::util::{compact_text, sanitize};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

pub(super) async fn decode<T: DeserializeOwned>(
    operation: &'static str,
    response: Response,
) -> BackendResult<T> {
    let status = response.status();
    let body = response.text().await.map_err(|error| {
        BackendError::Unavailable(format!("{operation} body read failed: {}", describe(error)))
    })?;

    let Ok(envelope) = serde_json::from_str::<Envelope<T>>(&body) else {
        if status.is_success() {
            return Err(BackendError::Rejected(format!(
                "{operation} returned an unreadable payload: {}",
                compact_text(&body)
            )));
        }
        return Err(classify(operation, status, None, &compact_text(&body)));
    };

    if envelope.ok {
        return envelope.result.ok_or_else(|| {
            BackendError::Rejected(format!("{operation} returned no result"))
        });
    }

    let description = envelope.description.unwrap_or_default();
    let code = envelope
        .error_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(status);
    Err(classify(operation, code, Some(&description), &description))
}

pub(super) fn transport(operation: &'static str, error: reqwest::Error) -> BackendError {
    BackendError::Unavailable(format!("{operation} request failed: {}", describe(error)))
}

/// Bot API URLs carry the bot token, so request errors drop theirs.
fn describe(error: reqwest::Error) -> String {
    sanitize(&error.without_url())
}

fn classify(
    operation: &'static str,
    status: StatusCode,
    description: Option<&str>,
    detail: &str,
) -> BackendError {
    let tag = description.unwrap_or_default();
    if tag.contains("SESSION_PASSWORD_NEEDED") {
        return BackendError::PasswordRequired;
    }
    if tag.contains("PHONE_CODE_") {
        return BackendError::InvalidCode;
    }
    if tag.contains("UPLOAD_ID_CONFLICT") {
        return BackendError::UploadIdConflict;
    }
    if status == StatusCode::UNAUTHORIZED || tag.contains("AUTH_KEY_UNREGISTERED") {
        return BackendError::Unauthorized(format!("{operation}: {detail}"));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return BackendError::Unavailable(format!(
            "{operation} failed with HTTP {}: {detail}",
            status.as_u16()
        ));
    }
    BackendError::Rejected(format!(
        "{operation} failed with HTTP {}: {detail}",
        status.as_u16()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_errors_never_carry_the_request_url() {
        let error = reqwest::Client::new()
            .get("http://127.0.0.1:1/bot123456:secret-bot-token/getFile")
            .send()
            .await
            .unwrap_err();
        let BackendError::Unavailable(message) = transport("getFile", error) else {
            panic!("expected an unavailable backend");
        };
        assert!(message.starts_with("getFile request failed"));
        assert!(!message.contains("secret-bot-token"));
        assert!(!message.contains("127.0.0.1"));
    }

    #[test]
    fn classify_maps_auth_tags() {
        assert_eq!(
            classify("sign_in", StatusCode::BAD_REQUEST, Some("SESSION_PASSWORD_NEEDED"), ""),
            BackendError::PasswordRequired
        );
        assert_eq!(
            classify("sign_in", StatusCode::BAD_REQUEST, Some("PHONE_CODE_EXPIRED"), ""),
            BackendError::InvalidCode
        );
    }

    #[test]
    fn classify_maps_collision_and_unauthorized() {
        assert_eq!(
            classify("save_part", StatusCode::CONFLICT, Some("UPLOAD_ID_CONFLICT"), ""),
            BackendError::UploadIdConflict
        );
        assert!(matches!(
            classify("me", StatusCode::UNAUTHORIZED, None, "nope"),
            BackendError::Unauthorized(_)
        ));
    }

    #[test]
    fn classify_separates_server_and_client_failures() {
        assert!(matches!(
            classify("getFile", StatusCode::BAD_GATEWAY, None, ""),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            classify("getFile", StatusCode::BAD_REQUEST, Some("file is too big"), "file is too big"),
            BackendError::Rejected(_)
        ));
    }
}
