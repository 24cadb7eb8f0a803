//! Worker error types.

use thiserror::Error;

use i2m_fal_client::FalError;
use i2m_storage::StorageError;
use i2m_store::StoreError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Generation failed: {0}")]
    Generation(#[from] FalError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn processing_failed(msg: impl Into<String>) -> Self {
        Self::ProcessingFailed(msg.into())
    }

    /// Check if error is retryable.
    ///
    /// Redis outages, local IO and transient generator errors are worth
    /// another delivery; a missing job record or a rejected image is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Generation(e) => e.is_retryable(),
            WorkerError::Store(e) => matches!(
                e,
                StoreError::ConnectionFailed(_) | StoreError::Redis(_)
            ),
            WorkerError::Storage(e) => matches!(
                e,
                StorageError::Io(_) | StorageError::WriteFailed(_)
            ),
            WorkerError::Io(_) => true,
            WorkerError::JobFailed(_) | WorkerError::ProcessingFailed(_) => false,
        }
    }
}
