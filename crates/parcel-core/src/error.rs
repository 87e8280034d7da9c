//! Error types for parcel-core

use thiserror::Error;

use crate::backend::BackendError;

/// Result type alias using parcel-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in parcel-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Download signature did not match
    #[error("Download signature is invalid")]
    SignatureInvalid,

    /// Download signature is past its expiry
    #[error("Download signature has expired")]
    SignatureExpired,

    /// Large-file relay needs an authorized backend session
    #[error("Backend session is not authorized; complete the auth handshake first")]
    AuthRequired,

    /// `verify_code` was called without a preceding `request_code`
    #[error("No login code is pending; request a code first")]
    NoPendingCode,

    /// The backend account has a second factor configured
    #[error("Backend account requires a second-factor password, which is unsupported")]
    TwoFactorUnsupported,

    /// The backend refused the login code
    #[error("Login code was rejected by the backend")]
    InvalidCode,

    /// Handshake requested while already signed in
    #[error("Backend session is already authorized")]
    AlreadyAuthorized,

    /// A part upload failed; the session cannot continue
    #[error("Upload {upload_id} failed at part {part_index}: {reason}")]
    PartUploadFailed {
        upload_id: u32,
        part_index: u32,
        reason: String,
    },

    /// Parts were uploaded out of positional order
    #[error("Upload {upload_id} expected part {expected}, got {actual}")]
    PartOutOfOrder {
        upload_id: u32,
        expected: u32,
        actual: u32,
    },

    /// Commit attempted before every part was acknowledged
    #[error("Upload {upload_id} has {acknowledged}/{total} parts; cannot commit")]
    CommitIncomplete {
        upload_id: u32,
        acknowledged: u32,
        total: u32,
    },

    /// The backend answered without a usable file handle
    #[error("Backend rejected the file: {0}")]
    BackendRejected(String),

    /// The backend could not be reached or failed
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error must be answered with a 403-equivalent.
    pub const fn is_signature_failure(&self) -> bool {
        matches!(self, Self::SignatureInvalid | Self::SignatureExpired)
    }

    /// Stable machine-readable code for API responses.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "signature_invalid",
            Self::SignatureExpired => "signature_expired",
            Self::AuthRequired => "auth_required",
            Self::NoPendingCode => "no_pending_code",
            Self::TwoFactorUnsupported => "two_factor_unsupported",
            Self::InvalidCode => "invalid_code",
            Self::AlreadyAuthorized => "already_authorized",
            Self::PartUploadFailed { .. } => "part_upload_failed",
            Self::PartOutOfOrder { .. } => "part_out_of_order",
            Self::CommitIncomplete { .. } => "commit_incomplete",
            Self::BackendRejected(_) => "backend_rejected",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
        }
    }
}

impl From<BackendError> for Error {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Rejected(reason) => Self::BackendRejected(reason),
            BackendError::Unauthorized(_) => Self::AuthRequired,
            BackendError::PasswordRequired => Self::TwoFactorUnsupported,
            BackendError::InvalidCode => Self::InvalidCode,
            BackendError::UploadIdConflict => {
                Self::BackendRejected("upload identifier already in use".to_string())
            }
            BackendError::Unavailable(reason) => Self::BackendUnavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_onto_the_core_taxonomy() {
        assert!(matches!(
            Error::from(BackendError::Unauthorized("AUTH_KEY_UNREGISTERED".to_string())),
            Error::AuthRequired
        ));
        assert!(matches!(
            Error::from(BackendError::PasswordRequired),
            Error::TwoFactorUnsupported
        ));
        assert!(matches!(
            Error::from(BackendError::Unavailable("timeout".to_string())),
            Error::BackendUnavailable(_)
        ));
    }

    #[test]
    fn only_signature_errors_are_signature_failures() {
        assert!(Error::SignatureExpired.is_signature_failure());
        assert!(!Error::AuthRequired.is_signature_failure());
        assert_eq!(Error::TwoFactorUnsupported.code(), "two_factor_unsupported");
    }
}
