//! Reactive propagation graph for stator
//!
//! Mappers are named computations compiled from a TQL definition. Each mapper
//! registers one tentacle per watched `entity#path` key; when an actor commits
//! a change on a watched key, the [`TentacleGraph`] feeds the new value to
//! every interested mapper and collects the patches they emit for their
//! target entity.
//!
//! The graph is a materialized lookup table of explicit edges, not a chain of
//! recursive calls. Cycles across entities are possible; bounding them is the
//! job of whoever dispatches the resulting patches.

#![warn(missing_debug_implementations)]

pub mod error;
pub mod graph;
pub mod projection;
pub mod record;

pub use error::MapperError;
pub use graph::{Activation, TentacleGraph};
pub use projection::{ProjectionCompiler, ProjectionMapper};
pub use record::MapperRecord;

use serde_json::Value;
use stator_types::{EntityId, PatchData};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Key of a watched property: `entity#path`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey(String);

impl WatchKey {
    pub fn new(entity_id: &EntityId, path: &str) -> Self {
        WatchKey(format!("{}#{}", entity_id, path))
    }

    pub fn entity(&self) -> &str {
        self.0.split_once('#').map_or(self.0.as_str(), |(entity, _)| entity)
    }

    pub fn path(&self) -> &str {
        self.0.split_once('#').map_or("", |(_, path)| path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One watch registered by a mapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tentacle {
    pub mapper_id: String,
    pub entity_id: EntityId,
    pub path: String,
}

impl Tentacle {
    pub fn new(mapper_id: impl Into<String>, entity_id: EntityId, path: impl Into<String>) -> Self {
        Self {
            mapper_id: mapper_id.into(),
            entity_id,
            path: path.into(),
        }
    }

    pub fn key(&self) -> WatchKey {
        WatchKey::new(&self.entity_id, &self.path)
    }
}

/// Latest known value per watched key, as seen by one mapper
pub type MapperInputs = BTreeMap<WatchKey, Value>;

/// A compiled mapper
pub trait Mapper: Send + Sync + fmt::Debug {
    /// Mapper identifier (unique across the cluster)
    fn id(&self) -> &str;

    /// Entity that receives the computed patches
    fn target(&self) -> &EntityId;

    /// Watches this mapper needs
    fn tentacles(&self) -> Vec<Tentacle>;

    /// Compute the patches for the target from the current inputs
    fn exec(&self, inputs: &MapperInputs) -> Result<Vec<PatchData>, MapperError>;
}

/// Turns stored mapper definitions into runnable mappers
pub trait MapperCompiler: Send + Sync + fmt::Debug {
    fn compile(&self, record: &MapperRecord) -> Result<Arc<dyn Mapper>, MapperError>;
}
