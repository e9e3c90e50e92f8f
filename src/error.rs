// Detection Summary Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid episode key: {0:?}")]
    InvalidEpisodeKey(String),

    #[error("Session already active for episode {0}")]
    SessionActive(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Image generation error: {0}")]
    ImageGeneration(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for SummaryError {
    fn from(err: anyhow::Error) -> Self {
        SummaryError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SummaryError>;
