//! Per-queue machine containers
//!
//! A container owns the machines of one queue. Machines created for a first
//! delivery sit in a separate pending map until that delivery succeeds, so
//! [`Container::load`] never returns a half-initialised machine while
//! concurrent first deliveries still share one pending machine.

use crate::error::{Result, RuntimeError};
use crate::statem::StateMachine;
use parking_lot::RwLock;
use stator_types::EntityId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct Container {
    id: String,
    machines: RwLock<HashMap<EntityId, Arc<StateMachine>>>,
    creating: RwLock<HashMap<EntityId, Arc<StateMachine>>>,
}

impl Container {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            machines: RwLock::new(HashMap::new()),
            creating: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn load(&self, id: &EntityId) -> Result<Arc<StateMachine>> {
        self.machines
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::EntityNotFound(id.clone()))
    }

    /// Machine created for a first delivery that has not succeeded yet
    pub fn pending(&self, id: &EntityId) -> Option<Arc<StateMachine>> {
        self.creating.read().get(id).cloned()
    }

    /// Park `machine` as pending, unless another machine for the same id is
    /// already registered or pending; that one is returned instead.
    pub fn insert_pending(&self, machine: Arc<StateMachine>) -> Arc<StateMachine> {
        let id = machine.id().clone();
        let mut creating = self.creating.write();
        if let Some(existing) = self.machines.read().get(&id).cloned() {
            return existing;
        }
        creating.entry(id).or_insert(machine).clone()
    }

    /// Make a pending machine visible to [`Self::load`]. A machine already
    /// registered under the same id is kept.
    pub fn promote(&self, machine: &Arc<StateMachine>) {
        let id = machine.id();
        let mut creating = self.creating.write();
        if creating.get(id).is_some_and(|m| Arc::ptr_eq(m, machine)) {
            creating.remove(id);
        }
        let mut machines = self.machines.write();
        if !machines.contains_key(id) {
            machines.insert(id.clone(), machine.clone());
            debug!(queue = %self.id, entity_id = %id, "machine registered");
        }
    }

    /// Drop a pending machine whose first delivery failed
    pub fn abandon(&self, machine: &Arc<StateMachine>) {
        let id = machine.id();
        let mut creating = self.creating.write();
        if creating.get(id).is_some_and(|m| Arc::ptr_eq(m, machine)) {
            creating.remove(id);
            debug!(queue = %self.id, entity_id = %id, "pending machine abandoned");
        }
    }

    pub fn remove(&self, id: &EntityId) -> Option<Arc<StateMachine>> {
        self.machines.write().remove(id)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.machines.read().keys().cloned().collect()
    }

    pub fn machines(&self) -> Vec<Arc<StateMachine>> {
        self.machines.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.machines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.read().is_empty()
    }
}
