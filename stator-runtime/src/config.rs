//! Runtime configuration

use crate::entity::DefaultPathPolicy;
use serde::{Deserialize, Serialize};

/// Settings consumed once, when a node is constructed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Identity of this node in the placement table
    pub node_name: String,
    /// Number of queues entities are hashed into
    pub queue_count: usize,
    /// Queue ids are `<prefix>-<n>`
    pub queue_prefix: String,
    pub mailbox_capacity: usize,
    /// Attempts to enqueue into a full mailbox before reporting backpressure
    pub put_retries: usize,
    /// Idle cycles an empty actor spins before detaching
    pub ensure_consume_times: u32,
    /// Handled messages between two flushes
    pub flush_period: u32,
    /// Longest chain of mapper-generated events
    pub max_propagation_depth: u32,
    pub default_path_policy: DefaultPathPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_name: "stator-0".to_string(),
            queue_count: 8,
            queue_prefix: "core".to_string(),
            mailbox_capacity: 20,
            put_retries: 5,
            ensure_consume_times: 3,
            flush_period: 10,
            max_propagation_depth: 8,
            default_path_policy: DefaultPathPolicy::Reject,
        }
    }
}
