//! Tentacle lookup table
//!
//! Edges are stored as `watch key -> tentacles`, the reverse-dependency layout
//! of an incremental query database: a change on a key finds its dependents
//! with one map lookup. Matching is exact, not by prefix.

use crate::{Mapper, MapperInputs, Tentacle, WatchKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use stator_types::{EntityId, PatchData};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Patches produced by one mapper activation
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub mapper_id: String,
    pub target: EntityId,
    pub patches: Vec<PatchData>,
}

struct MapperSlot {
    mapper: Arc<dyn Mapper>,
    /// Last value seen on each watched key
    inputs: Mutex<MapperInputs>,
}

/// Registry of mappers and the keys they watch
#[derive(Default)]
pub struct TentacleGraph {
    /// Watch key -> tentacles registered on it
    edges: DashMap<WatchKey, Vec<Tentacle>>,

    /// Mapper id -> mapper with its input cache
    mappers: DashMap<String, Arc<MapperSlot>>,
}

impl fmt::Debug for TentacleGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TentacleGraph")
            .field("edges", &self.edges.len())
            .field("mappers", &self.mappers.len())
            .finish()
    }
}

impl TentacleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper, replacing any mapper with the same id
    pub fn register(&self, mapper: Arc<dyn Mapper>) {
        let id = mapper.id().to_string();
        self.unregister(&id);

        for tentacle in mapper.tentacles() {
            self.edges.entry(tentacle.key()).or_default().push(tentacle);
        }
        self.mappers.insert(
            id.clone(),
            Arc::new(MapperSlot {
                mapper,
                inputs: Mutex::new(MapperInputs::new()),
            }),
        );
        debug!(mapper_id = %id, "registered mapper");
    }

    /// Remove a mapper and all of its tentacles
    pub fn unregister(&self, mapper_id: &str) -> bool {
        let Some((_, slot)) = self.mappers.remove(mapper_id) else {
            return false;
        };

        for tentacle in slot.mapper.tentacles() {
            let key = tentacle.key();
            let now_empty = match self.edges.get_mut(&key) {
                Some(mut tentacles) => {
                    tentacles.retain(|t| t.mapper_id != mapper_id);
                    tentacles.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.edges.remove_if(&key, |_, tentacles| tentacles.is_empty());
            }
        }
        debug!(mapper_id = %mapper_id, "unregistered mapper");
        true
    }

    /// Tentacles registered on exactly this key
    pub fn lookup(&self, key: &WatchKey) -> Vec<Tentacle> {
        self.edges
            .get(key)
            .map(|tentacles| tentacles.value().clone())
            .unwrap_or_default()
    }

    pub fn mapper(&self, mapper_id: &str) -> Option<Arc<dyn Mapper>> {
        self.mappers.get(mapper_id).map(|slot| slot.mapper.clone())
    }

    pub fn contains(&self, mapper_id: &str) -> bool {
        self.mappers.contains_key(mapper_id)
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Whether any tentacle watches a path of this entity
    pub fn watches(&self, entity_id: &EntityId) -> bool {
        self.edges
            .iter()
            .any(|entry| entry.key().entity() == entity_id.as_str())
    }

    /// Feed committed changes of `entity_id` to the watching mappers.
    ///
    /// Every mapper touched by at least one change runs once, after all
    /// changes have been recorded in its input cache. Mapper failures are
    /// logged and skipped.
    pub fn activate(&self, entity_id: &EntityId, changes: &[(String, Value)]) -> Vec<Activation> {
        let mut touched: Vec<Arc<MapperSlot>> = Vec::new();

        for (path, value) in changes {
            let key = WatchKey::new(entity_id, path);
            for tentacle in self.lookup(&key) {
                let slot = self
                    .mappers
                    .get(&tentacle.mapper_id)
                    .map(|s| s.value().clone());
                let Some(slot) = slot else {
                    continue;
                };
                slot.inputs.lock().insert(key.clone(), value.clone());
                if !touched.iter().any(|s| Arc::ptr_eq(s, &slot)) {
                    touched.push(slot);
                }
            }
        }

        let mut activations = Vec::with_capacity(touched.len());
        for slot in touched {
            let inputs = slot.inputs.lock().clone();
            match slot.mapper.exec(&inputs) {
                Ok(patches) if patches.is_empty() => {}
                Ok(patches) => activations.push(Activation {
                    mapper_id: slot.mapper.id().to_string(),
                    target: slot.mapper.target().clone(),
                    patches,
                }),
                Err(err) => {
                    warn!(mapper_id = %slot.mapper.id(), entity_id = %entity_id, error = %err, "mapper exec failed");
                }
            }
        }
        activations
    }
}
