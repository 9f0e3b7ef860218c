//! Error types for the stator runtime

use crate::dispatch::DispatchError;
use crate::entity::PatchError;
use crate::repository::RepositoryError;
use stator_types::{EntityId, EnvelopeError};
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Malformed request, rejected without retry
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entity {0} not found")]
    EntityNotFound(EntityId),

    /// Persist or publish failure, retried on the next natural cycle
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// Mailbox still full after the bounded retries
    #[error("Mailbox of entity {0} is full")]
    Backpressure(EntityId),

    #[error("Entity {0} is deleted")]
    Deleted(EntityId),

    #[error("Entity {0} is inactive on this node")]
    Inactive(EntityId),

    #[error("Queue {queue} is owned by node {owner}")]
    NotOwner { queue: String, owner: String },

    #[error("Request cancelled")]
    Cancelled,

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl RuntimeError {
    /// Stable error code carried in response metadata
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::Validation(_) | RuntimeError::Envelope(_) => "validation",
            RuntimeError::EntityNotFound(_) => "entity_not_found",
            RuntimeError::TransientIo(_) => "transient_io",
            RuntimeError::Backpressure(_) => "backpressure",
            RuntimeError::Deleted(_) => "entity_deleted",
            RuntimeError::Inactive(_) => "entity_inactive",
            RuntimeError::NotOwner { .. } => "not_owner",
            RuntimeError::Cancelled => "cancelled",
            RuntimeError::Internal(_) => "internal",
            RuntimeError::Patch(_) => "patch_invalid",
            RuntimeError::Repository(_) => "repository",
            RuntimeError::Dispatch(_) => "dispatch",
        }
    }
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
