//! Error types for fde

use thiserror::Error;

/// Main error type shared by the client and the server
#[derive(Error, Debug)]
pub enum FdeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Deploy error: {0}")]
    Deploy(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for FdeError {
    fn from(err: anyhow::Error) -> Self {
        FdeError::Internal(err.to_string())
    }
}
