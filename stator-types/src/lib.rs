//! Shared types for stator
//!
//! This crate provides the vocabulary shared across the stator workspace:
//! entity identifiers, the event envelope delivered over the message bus,
//! patch and system-operation payloads, and the response record used to
//! correlate asynchronous results with waiting callers.

mod event;
mod patch;
mod response;
mod view;

pub use event::{meta, Event, EventType, Payload, PathConstructor, SystemData, SystemOp};
pub use patch::{PatchData, PatchOp};
pub use response::{Response, ResponseStatus};
pub use view::{field, EntityRecord, EntityView, MapperView};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Entity identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, globally unique entity identifier
    pub fn generate() -> Self {
        Self(format!("en-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId(id)
    }
}

/// Errors raised while interpreting an event envelope
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("unknown {kind}: {value:?}")]
    UnknownLiteral { kind: &'static str, value: String },

    #[error("missing metadata field {0}")]
    MissingField(&'static str),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Generate a caller-side request identifier
pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

/// Generate an event identifier
pub fn event_id() -> String {
    format!("ev-{}", Uuid::new_v4().simple())
}
