// ABOUTME: Error types for execution submission and history queries
// ABOUTME: Execution outcomes are not errors; they are recorded on the execution itself

use corral_sessions::SessionError;
use corral_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Invalid execution parameters: {0}")]
    InvalidParams(String),

    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for ExecutionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => ExecutionError::NotFound(id),
            other => ExecutionError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
