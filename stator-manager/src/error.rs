//! Error types for the API manager

use stator_runtime::{DispatchError, RepositoryError};
use stator_types::EnvelopeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("request {0} timed out")]
    Timeout(String),

    #[error("request {0} cancelled")]
    Cancelled(String),

    /// The node answered with an error status
    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("decode response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("mapper {0} not found")]
    MapperNotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl ManagerError {
    /// Error code reported by the node, if any
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            ManagerError::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
