//! Change propagation
//!
//! After an actor commits a batch, its field-level changes are fed to the
//! tentacle graph. Every mapper activation becomes a patch event addressed
//! to the mapper's target entity and goes back out through the dispatcher,
//! so the target applies it in its own actor like any other request.

use crate::dispatch::Dispatcher;
use crate::entity::PatchEntity;
use serde_json::Value;
use stator_mapper::TentacleGraph;
use stator_types::{meta, Event, PatchData, PatchOp};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct Propagator {
    graph: Arc<TentacleGraph>,
    dispatcher: Arc<dyn Dispatcher>,
    max_depth: u32,
}

impl Propagator {
    pub fn new(graph: Arc<TentacleGraph>, dispatcher: Arc<dyn Dispatcher>, max_depth: u32) -> Self {
        Self {
            graph,
            dispatcher,
            max_depth,
        }
    }

    pub fn graph(&self) -> &Arc<TentacleGraph> {
        &self.graph
    }

    /// Dispatch the patches produced by `changes` of `source`.
    ///
    /// `parent_depth` is the propagation depth of the event that caused the
    /// changes. Generated events carry `parent_depth + 1`; events that would
    /// exceed the configured maximum are dropped with a warning.
    pub async fn propagate(&self, source: &PatchEntity, parent_depth: u32, changes: &[PatchData]) {
        if changes.is_empty() {
            return;
        }

        let inputs: Vec<(String, Value)> = changes
            .iter()
            .filter_map(|change| match change.op {
                PatchOp::Copy => None,
                PatchOp::Remove => Some((change.path.clone(), Value::Null)),
                _ => Some((change.path.clone(), change.value.clone())),
            })
            .collect();

        let activations = self.graph.activate(source.id(), &inputs);
        if activations.is_empty() {
            return;
        }

        let depth = parent_depth + 1;
        if depth > self.max_depth {
            warn!(
                entity_id = %source.id(),
                depth,
                max_depth = self.max_depth,
                dropped = activations.len(),
                "propagation depth exceeded"
            );
            return;
        }

        for activation in activations {
            debug!(
                mapper_id = %activation.mapper_id,
                source = %source.id(),
                target = %activation.target,
                depth,
                "propagate mapper output"
            );
            let event = Event::patch_event(&activation.target, activation.patches)
                .with_attr(meta::SENDER, source.id().as_str())
                .with_attr(meta::ENTITY_TYPE, source.entity_type())
                .with_attr(meta::OWNER, source.owner())
                .with_attr(meta::SOURCE, source.source())
                .with_attr(meta::PROPAGATION_DEPTH, depth.to_string());

            if let Err(err) = self.dispatcher.dispatch(event).await {
                error!(
                    mapper_id = %activation.mapper_id,
                    target = %activation.target,
                    error = %err,
                    "dispatch propagated patch"
                );
            }
        }
    }
}
