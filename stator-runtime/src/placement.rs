//! Queue placement
//!
//! Entities hash onto a fixed table of queues; every queue names the node
//! that owns it. Any node holding the same table resolves the same owner.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stator_types::EntityId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueInfo {
    pub id: String,
    pub node_name: String,
}

impl QueueInfo {
    pub fn new(id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_name: node_name.into(),
        }
    }
}

/// `count` queues named `<prefix>-<n>`, all owned by `node_name`
pub fn uniform(prefix: &str, count: usize, node_name: &str) -> Vec<QueueInfo> {
    (0..count)
        .map(|n| QueueInfo::new(format!("{}-{}", prefix, n), node_name))
        .collect()
}

#[derive(Debug, Default)]
pub struct Placement {
    queues: RwLock<Vec<QueueInfo>>,
}

impl Placement {
    pub fn new(queues: Vec<QueueInfo>) -> Self {
        Self {
            queues: RwLock::new(queues),
        }
    }

    /// Queue of `id`; `None` while the table is empty
    pub fn select(&self, id: &EntityId) -> Option<QueueInfo> {
        let queues = self.queues.read();
        if queues.is_empty() {
            return None;
        }
        let slot = (hash64(id) % queues.len() as u64) as usize;
        queues.get(slot).cloned()
    }

    /// Swap in a new table, returning the old one
    pub fn replace(&self, queues: Vec<QueueInfo>) -> Vec<QueueInfo> {
        std::mem::replace(&mut *self.queues.write(), queues)
    }

    pub fn queues(&self) -> Vec<QueueInfo> {
        self.queues.read().clone()
    }

    /// Whether `queue_id` is currently owned by `node_name`
    pub fn is_local(&self, queue_id: &str, node_name: &str) -> bool {
        self.queues
            .read()
            .iter()
            .any(|q| q.id == queue_id && q.node_name == node_name)
    }
}

fn hash64(id: &EntityId) -> u64 {
    let hash = blake3::hash(id.as_str().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(head)
}
