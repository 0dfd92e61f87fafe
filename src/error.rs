use std::path::PathBuf;
use thiserror::Error as ThisError;

/// Startup failures. Everything that happens after startup is handled
/// per item inside the pipeline and never surfaces here.
#[derive(ThisError, Debug)]
pub enum AggregatorError {
    #[error("Could not open access token file {path}: {source}")]
    CredentialUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Access token file {0} is empty")]
    CredentialEmpty(PathBuf),

    #[error("Invalid upstream endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to bind HTTP listener on {addr}: {source}")]
    HttpBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    SinkConnect(#[from] crate::backoff::RetryError<std::io::Error>),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
