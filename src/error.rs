use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandfixError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Wrong master password or a tampered/corrupted vault file.
    #[error("Failed to decrypt configuration: wrong master password or corrupted vault")]
    Decryption,

    #[error("Unsafe file path in proposed fix: {0}")]
    UnsafePath(String),

    #[error("AI service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("API request failed: {0}")]
    ApiRequest(String),

    #[error("Maximum attempts reached for command '{command}' ({attempts} attempt(s))")]
    RetriesExhausted { command: String, attempts: u32 },

    #[error("Command '{command}' failed and cannot be fixed automatically: {reason}")]
    Unrecoverable { command: String, reason: String },

    #[error("Git error: {0}")]
    Git(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Dialog error: {0}")]
    Dialog(String),
}

impl From<dialoguer::Error> for SandfixError {
    fn from(err: dialoguer::Error) -> Self {
        SandfixError::Dialog(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandfixError>;
