// ABOUTME: Error types for session lifecycle operations
// ABOUTME: Distinguishes lifecycle conflicts from provider and storage failures

use crate::types::SessionState;
use corral_sandbox::ProviderError;
use corral_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Session {0} already has a transition in progress")]
    ConflictingTransition(String),

    #[error("Cannot {operation} session {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: SessionState,
        operation: &'static str,
    },

    #[error("Session {id} is {state}, not running")]
    NotRunning { id: String, state: SessionState },

    #[error("Session {session_id} is busy with execution {execution_id}")]
    SessionBusy {
        session_id: String,
        execution_id: String,
    },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => SessionError::NotFound(id),
            other => SessionError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
