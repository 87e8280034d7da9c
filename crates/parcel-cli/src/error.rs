use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] parcel_core::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid link: {0}")]
    InvalidLink(String),
    #[error("Request to parcel-api failed: {0}")]
    Transport(String),
    #[error("parcel-api returned {status}: {message}")]
    Api { status: u16, message: String },
}
