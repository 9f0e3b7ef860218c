//! Repository collaborator
//!
//! The repository persists entity snapshots and mapper definitions. Mapper
//! writes are revisioned so a node can range the definitions at a revision
//! and then watch every change made after it.

use async_trait::async_trait;
use parking_lot::Mutex;
use stator_mapper::MapperRecord;
use stator_types::EntityId;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("repository backend failure: {0}")]
    Backend(String),

    #[error("repository codec failure: {0}")]
    Codec(String),
}

/// Change to a mapper definition
#[derive(Debug, Clone, PartialEq)]
pub enum MapperEvent {
    Put(MapperRecord),
    Delete(MapperRecord),
}

/// Filter for [`Repository::list_mappers`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapperFilter {
    pub owner: Option<String>,
    pub entity_id: Option<EntityId>,
}

impl MapperFilter {
    pub fn entity(entity_id: EntityId) -> Self {
        Self {
            owner: None,
            entity_id: Some(entity_id),
        }
    }

    pub fn matches(&self, record: &MapperRecord) -> bool {
        self.owner.as_ref().map_or(true, |owner| owner == &record.owner)
            && self
                .entity_id
                .as_ref()
                .map_or(true, |entity_id| entity_id == &record.entity_id)
    }
}

#[async_trait]
pub trait Repository: Send + Sync + std::fmt::Debug {
    async fn put_entity(&self, id: &EntityId, state: Vec<u8>) -> Result<(), RepositoryError>;
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Vec<u8>>, RepositoryError>;
    async fn del_entity(&self, id: &EntityId) -> Result<(), RepositoryError>;

    async fn put_mapper(&self, record: MapperRecord) -> Result<(), RepositoryError>;
    async fn get_mapper(&self, id: &str) -> Result<Option<MapperRecord>, RepositoryError>;
    async fn del_mapper(&self, id: &str) -> Result<(), RepositoryError>;
    async fn list_mappers(&self, filter: &MapperFilter) -> Result<Vec<MapperRecord>, RepositoryError>;

    /// Mapper definitions as of `revision`
    async fn range_mappers(&self, revision: u64) -> Result<Vec<MapperRecord>, RepositoryError>;

    /// Mapper changes made after `revision`, then every later change
    async fn watch_mappers(
        &self,
        revision: u64,
    ) -> Result<mpsc::UnboundedReceiver<MapperEvent>, RepositoryError>;

    async fn last_revision(&self) -> Result<u64, RepositoryError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    revision: u64,
    entities: HashMap<EntityId, Vec<u8>>,
    /// id -> (record, revision of last write)
    mappers: BTreeMap<String, (MapperRecord, u64)>,
    history: Vec<(u64, MapperEvent)>,
    watchers: Vec<mpsc::UnboundedSender<MapperEvent>>,
}

impl MemoryState {
    fn publish(&mut self, event: MapperEvent) {
        self.revision += 1;
        self.history.push((self.revision, event.clone()));
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// In-memory repository
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.state.lock().entities.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn put_entity(&self, id: &EntityId, state: Vec<u8>) -> Result<(), RepositoryError> {
        self.state.lock().entities.insert(id.clone(), state);
        Ok(())
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Option<Vec<u8>>, RepositoryError> {
        Ok(self.state.lock().entities.get(id).cloned())
    }

    async fn del_entity(&self, id: &EntityId) -> Result<(), RepositoryError> {
        self.state.lock().entities.remove(id);
        Ok(())
    }

    async fn put_mapper(&self, record: MapperRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        let revision = state.revision + 1;
        state
            .mappers
            .insert(record.id.clone(), (record.clone(), revision));
        state.publish(MapperEvent::Put(record));
        Ok(())
    }

    async fn get_mapper(&self, id: &str) -> Result<Option<MapperRecord>, RepositoryError> {
        Ok(self.state.lock().mappers.get(id).map(|(record, _)| record.clone()))
    }

    async fn del_mapper(&self, id: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        if let Some((record, _)) = state.mappers.remove(id) {
            state.publish(MapperEvent::Delete(record));
        }
        Ok(())
    }

    async fn list_mappers(&self, filter: &MapperFilter) -> Result<Vec<MapperRecord>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .mappers
            .values()
            .filter(|(record, _)| filter.matches(record))
            .map(|(record, _)| record.clone())
            .collect())
    }

    async fn range_mappers(&self, revision: u64) -> Result<Vec<MapperRecord>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .mappers
            .values()
            .filter(|(_, rev)| *rev <= revision)
            .map(|(record, _)| record.clone())
            .collect())
    }

    async fn watch_mappers(
        &self,
        revision: u64,
    ) -> Result<mpsc::UnboundedReceiver<MapperEvent>, RepositoryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for (_, event) in state.history.iter().filter(|(rev, _)| *rev > revision) {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(event.clone());
        }
        state.watchers.push(tx);
        Ok(rx)
    }

    async fn last_revision(&self) -> Result<u64, RepositoryError> {
        Ok(self.state.lock().revision)
    }
}
