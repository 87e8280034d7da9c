use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use parcel_core::Error as CoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Too many requests: {0}")]
    TooManyRequests(String, u64),
    #[error("External dependency error: {0}")]
    External(String),
    #[error("Internal server error: {0}")]
    Internal(String),
    /// Auth handshake failure, reported to the operator with its core code.
    #[error("Auth handshake failed: {0}")]
    Handshake(CoreError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn too_many_requests(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::TooManyRequests(message.into(), retry_after_secs)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Every handshake failure is a 400 carrying the core code.
    pub const fn handshake(error: CoreError) -> Self {
        Self::Handshake(error)
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "auth_required",
            Self::TooManyRequests(_, _) => "rate_limited",
            Self::External(_) => "backend_error",
            Self::Internal(_) => "internal",
            Self::Handshake(error) => error.code(),
        }
    }
}

impl From<CoreError> for AppError {
    fn from(error: CoreError) -> Self {
        match error {
            // never echo anything beyond the generic message
            CoreError::SignatureInvalid | CoreError::SignatureExpired => {
                Self::Forbidden(error.to_string())
            }
            CoreError::AuthRequired => Self::Conflict(error.to_string()),
            CoreError::NotFound(what) => Self::NotFound(what),
            CoreError::InvalidInput(message) => Self::BadRequest(message),
            CoreError::NoPendingCode
            | CoreError::TwoFactorUnsupported
            | CoreError::InvalidCode
            | CoreError::AlreadyAuthorized
            | CoreError::PartOutOfOrder { .. } => Self::BadRequest(error.to_string()),
            CoreError::PartUploadFailed { .. }
            | CoreError::CommitIncomplete { .. }
            | CoreError::BackendRejected(_)
            | CoreError::BackendUnavailable(_) => Self::External(error.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) | Self::Handshake(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests(_, _) => StatusCode::TOO_MANY_REQUESTS,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after = match self {
            Self::TooManyRequests(_, secs) => Some(secs.max(1)),
            _ => None,
        };
        // backend and internal detail stays in the logs
        let message = match &self {
            Self::External(detail) => {
                tracing::warn!(detail = %detail, "Backend request failed");
                "Backend request failed".to_string()
            }
            Self::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal server error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: message,
            code: self.code(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failures_are_forbidden() {
        let response = AppError::from(CoreError::SignatureExpired).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = AppError::too_many_requests("slow down", 12).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
    }

    #[test]
    fn handshake_errors_keep_their_core_code() {
        let error = AppError::handshake(CoreError::TwoFactorUnsupported);
        assert_eq!(error.code(), "two_factor_unsupported");
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);

        let error = AppError::handshake(CoreError::BackendUnavailable("down".to_string()));
        assert_eq!(error.code(), "backend_unavailable");
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn backend_failures_hide_their_detail() {
        let error = AppError::from(CoreError::BackendUnavailable(
            "getFile failed at https://api.example.test/bot123:secret/getFile".to_string(),
        ));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Backend request failed");
        assert_eq!(body["code"], "backend_error");
    }
}
