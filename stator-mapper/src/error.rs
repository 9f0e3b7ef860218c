//! Error types for mapper compilation and execution

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MapperError {
    #[error("compile mapper {id}: {reason}")]
    Compile { id: String, reason: String },

    #[error("mapper {0} has no input values")]
    MissingInput(String),
}

impl MapperError {
    pub(crate) fn compile(id: &str, reason: impl Into<String>) -> Self {
        MapperError::Compile {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}
