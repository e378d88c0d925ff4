use config::ConfigError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Extraction error: {0}")]
    Extraction(String),
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Rerank error: {0}")]
    Rerank(String),
    #[error("Retrieval error: {0}")]
    Retrieval(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Transient failures a caller may retry as-is after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::CapacityExceeded(_)
                | AppError::Embedding(_)
                | AppError::Store(_)
                | AppError::Rerank(_)
                | AppError::Retrieval(_)
                | AppError::Timeout(_)
        )
    }

    /// Caller errors that will fail the same way on every attempt.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, AppError::InvalidArgument(_) | AppError::NotFound(_))
    }
}
