//! Default message handler for entity machines

use crate::error::{Result, RuntimeError};
use crate::statem::{Handled, MachineCore, MessageHandler};
use crate::subscription::{self, Publisher};
use async_trait::async_trait;
use stator_types::{Event, EventType, SystemOp};
use std::sync::Arc;
use tracing::{debug, error};

/// Applies system operations and patch batches, and fans out forwarded
/// changes reaching subscription entities
#[derive(Debug, Clone)]
pub struct EntityHandler {
    publisher: Arc<dyn Publisher>,
}

impl EntityHandler {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    fn handle_system(&self, core: &MachineCore, event: &Event) -> Result<Handled> {
        let system = event
            .system_data()
            .ok_or_else(|| RuntimeError::Validation("system event without system data".into()))?;

        match system.op()? {
            SystemOp::Create => {
                debug!(entity_id = %core.entity().id(), "entity created");
                Ok(Handled {
                    dirty: true,
                    ..Handled::default()
                })
            }
            SystemOp::Delete => Ok(Handled {
                deleted: true,
                ..Handled::default()
            }),
        }
    }

    async fn handle_entity(&self, core: &mut MachineCore, event: &Event) -> Result<Handled> {
        if subscription::is_fanout(core.entity(), event) {
            if let Err(err) = subscription::fan_out(core.entity(), event, self.publisher.as_ref()).await {
                error!(
                    subscription = %core.entity().id(),
                    code = err.code(),
                    error = %err,
                    "publish subscription message"
                );
            }
            return Ok(Handled::default());
        }

        let mode = event.path_constructor()?;
        let outcome = core.entity_mut().handle(event.patches(), mode);
        if let Some(err) = outcome.error {
            debug!(
                entity_id = %core.entity().id(),
                discarded = outcome.changes.len(),
                "patch batch rejected"
            );
            return Err(err.into());
        }

        Ok(Handled {
            changes: outcome.changes,
            ..Handled::default()
        })
    }
}

#[async_trait]
impl MessageHandler for EntityHandler {
    async fn handle(&self, core: &mut MachineCore, event: &Event) -> Result<Handled> {
        match event.event_type()? {
            EventType::System => self.handle_system(core, event),
            EventType::Entity => self.handle_entity(core, event).await,
            other => Err(RuntimeError::Validation(format!(
                "event type {} is not handled by entities",
                other.as_str()
            ))),
        }
    }
}
