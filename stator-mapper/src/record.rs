//! Stored mapper definitions

use serde::{Deserialize, Serialize};
use stator_types::{EntityId, MapperView};

/// Mapper definition as persisted in the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: String,
    /// Entity the mapper is attached to (its output target)
    pub entity_id: EntityId,
    pub tql: String,
    #[serde(default)]
    pub description: String,
}

impl MapperRecord {
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        entity_id: EntityId,
        tql: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            owner: owner.into(),
            entity_id,
            tql: tql.into(),
            description: String::new(),
        }
    }

    /// Whether `other` refers to the same owner and entity
    pub fn same_scope(&self, other: &MapperRecord) -> bool {
        self.owner == other.owner && self.entity_id == other.entity_id
    }

    pub fn view(&self) -> MapperView {
        MapperView {
            id: self.id.clone(),
            name: self.name.clone(),
            tql: self.tql.clone(),
            description: self.description.clone(),
        }
    }
}
