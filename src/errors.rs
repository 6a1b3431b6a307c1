use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Submission error: {0}")]
    Submission(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VaultError::Timeout(err.to_string())
        } else {
            VaultError::Transport(err.to_string())
        }
    }
}
