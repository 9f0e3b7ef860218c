//! Patch operations carried by entity events

use crate::EnvelopeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Operation applied to one path of an entity's property tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Append a value to the collection at the path
    Add,
    /// Reserved, interpreted outside the entity layer
    Copy,
    /// Deep-merge an object into the node at the path
    Merge,
    /// Delete the node at the path
    Remove,
    /// Overwrite the node at the path
    Replace,
}

impl PatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Copy => "copy",
            PatchOp::Merge => "merge",
            PatchOp::Remove => "remove",
            PatchOp::Replace => "replace",
        }
    }
}

impl FromStr for PatchOp {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(PatchOp::Add),
            "copy" => Ok(PatchOp::Copy),
            "merge" => Ok(PatchOp::Merge),
            "remove" => Ok(PatchOp::Remove),
            "replace" => Ok(PatchOp::Replace),
            _ => Err(EnvelopeError::UnknownLiteral {
                kind: "patch op",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One patch: operation, target path and value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchData {
    pub op: PatchOp,
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

impl PatchData {
    pub fn new(op: PatchOp, path: impl Into<String>, value: Value) -> Self {
        Self {
            op,
            path: path.into(),
            value,
        }
    }

    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self::new(PatchOp::Add, path, value)
    }

    pub fn merge(path: impl Into<String>, value: Value) -> Self {
        Self::new(PatchOp::Merge, path, value)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(PatchOp::Remove, path, Value::Null)
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::new(PatchOp::Replace, path, value)
    }
}
