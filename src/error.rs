use thiserror::Error;

use crate::domain::util::id::JobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse limiter configuration JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid limiter configuration: {0}")]
    Configuration(String),

    #[error("Job {job_id:?} was rejected by every model in the escalation order")]
    AllModelsRejected { job_id: JobId },

    #[error("Job {job_id:?} failed: {reason}")]
    JobFailed { job_id: JobId, reason: String },

    #[error("Distributed backend error: {0}")]
    Backend(String),

    #[error("Rate limiter was stopped before the job could be admitted")]
    Stopped,
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
