//! Subscription fan-out
//!
//! Entities of type `subscription` forward the changes of the entities they
//! watch to an external pub/sub topic. A patch that reaches a subscription
//! with a sender header is not applied to the subscription itself; its
//! changes are assembled into a payload and published according to the
//! subscription's `mode`, `topic` and `pubsub_name` properties.

use crate::entity::{path, PatchEntity};
use crate::error::RuntimeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use stator_types::{field, meta, Event, PatchData, PatchOp};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Entity type of subscription entities
pub const SUBSCRIPTION_TYPE: &str = "subscription";

const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PublishError {
    #[error("publish to {topic}: {reason}")]
    Failed { topic: String, reason: String },
}

/// Pub/sub collaborator
#[async_trait]
pub trait Publisher: Send + Sync + std::fmt::Debug {
    async fn publish(
        &self,
        topic: &str,
        pubsub_name: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError>;
}

/// A message accepted by [`MemoryPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub pubsub_name: String,
    pub payload: Vec<u8>,
    pub content_type: String,
}

/// Publisher that keeps everything it is given
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<Published>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        topic: &str,
        pubsub_name: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PublishError> {
        self.published.lock().push(Published {
            topic: topic.to_string(),
            pubsub_name: pubsub_name.to_string(),
            payload,
            content_type: content_type.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Publish on every matching change
    Realtime,
    /// Reserved
    OnChanged,
    /// Reserved
    Period,
}

impl FromStr for SubscriptionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REALTIME" => Ok(SubscriptionMode::Realtime),
            "ONCHANGED" => Ok(SubscriptionMode::OnChanged),
            "PERIOD" => Ok(SubscriptionMode::Period),
            other => Err(other.to_string()),
        }
    }
}

/// Whether the event is a forwarded change for a subscription entity
pub fn is_fanout(entity: &PatchEntity, event: &Event) -> bool {
    entity.entity_type() == SUBSCRIPTION_TYPE
        && event.attr(meta::SENDER).is_some_and(|sender| !sender.is_empty())
}

/// Assemble the outbound payload for a set of changes
pub fn make_payload(event: &Event, changes: &[PatchData]) -> Value {
    let mut tree = json!({ "properties": {} });
    for change in changes {
        let Ok(segs) = path::segments(&change.path) else {
            continue;
        };
        let applied = match change.op {
            PatchOp::Add => path::append(&mut tree, &segs, change.value.clone()),
            PatchOp::Merge => path::merge(&mut tree, &segs, &change.value),
            PatchOp::Replace => path::set(&mut tree, &segs, change.value.clone(), true),
            PatchOp::Copy | PatchOp::Remove => Ok(()),
        };
        if let Err(err) = applied {
            debug!(path = %change.path, error = %err, "skip change in subscription payload");
        }
    }

    let attr = |key: &str| Value::String(event.attr(key).unwrap_or_default().to_string());
    let mut payload = Map::new();
    payload.insert("id".into(), attr(meta::SENDER));
    payload.insert(
        "subscribe_id".into(),
        Value::String(event.entity().map(|id| id.0).unwrap_or_default()),
    );
    payload.insert("type".into(), attr(meta::ENTITY_TYPE));
    payload.insert("owner".into(), attr(meta::OWNER));
    payload.insert("source".into(), attr(meta::SOURCE));
    payload.insert(
        field::PROPERTIES.into(),
        tree.get(field::PROPERTIES).cloned().unwrap_or(Value::Null),
    );
    Value::Object(payload)
}

/// Publish the changes carried by `event` for subscription `entity`.
///
/// A failed publish is reported as [`RuntimeError::TransientIo`]; the
/// subscription's own state is never touched.
pub async fn fan_out(
    entity: &PatchEntity,
    event: &Event,
    publisher: &dyn Publisher,
) -> Result<(), RuntimeError> {
    let text = |key: &str| {
        entity
            .get_prop(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let (mode, topic, pubsub_name) = (text("mode"), text("topic"), text("pubsub_name"));
    let sender = event.attr(meta::SENDER).unwrap_or_default();

    let changes = event.patches();
    if changes.is_empty() {
        warn!(subscription = %entity.id(), sender = %sender, "publish empty message");
        return Ok(());
    }

    match mode.parse::<SubscriptionMode>() {
        Ok(SubscriptionMode::Realtime) => {
            let payload = make_payload(event, changes);
            let bytes = serde_json::to_vec(&payload)
                .map_err(|err| RuntimeError::Internal(format!("encode subscription payload: {}", err)))?;
            debug!(subscription = %entity.id(), sender = %sender, topic = %topic, "publish subscription message");
            publisher
                .publish(&topic, &pubsub_name, bytes, CONTENT_TYPE_JSON)
                .await
                .map_err(|err| RuntimeError::TransientIo(err.to_string()))
        }
        Ok(SubscriptionMode::OnChanged) | Ok(SubscriptionMode::Period) => {
            debug!(subscription = %entity.id(), mode = %mode, "subscription mode not firing");
            Ok(())
        }
        Err(unknown) => {
            warn!(subscription = %entity.id(), mode = %unknown, "unknown subscription mode");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SystemClock;
    use stator_types::{EntityId, EntityRecord, PathConstructor};
    use std::sync::Arc;

    fn subscription(mode: &str) -> PatchEntity {
        let mut record = EntityRecord::new(EntityId::new("sub-1"));
        record.entity_type = SUBSCRIPTION_TYPE.into();
        record.properties = json!({"mode": mode, "topic": "t", "pubsub_name": "ps"});
        PatchEntity::from_record(record, Arc::new(SystemClock))
    }

    fn forwarded() -> Event {
        Event::patch_event(
            &EntityId::new("sub-1"),
            vec![PatchData::replace("properties.temp", json!(21))],
        )
        .with_attr(meta::SENDER, "dev-1")
        .with_attr(meta::ENTITY_TYPE, "device")
        .with_attr(meta::OWNER, "admin")
    }

    #[test]
    fn test_make_payload() {
        let payload = make_payload(&forwarded(), forwarded().patches());
        assert_eq!(
            payload,
            json!({"id": "dev-1", "subscribe_id": "sub-1", "type": "device",
                   "owner": "admin", "source": "", "properties": {"temp": 21}})
        );
    }

    #[test]
    fn test_is_fanout() {
        let sub = subscription("REALTIME");
        assert!(is_fanout(&sub, &forwarded()));

        let direct = Event::patch_event(&EntityId::new("sub-1"), vec![]);
        assert!(!is_fanout(&sub, &direct));

        let mut device = sub.clone();
        device.handle(
            &[PatchData::replace("type", json!("device"))],
            PathConstructor::Default,
        );
        assert!(!is_fanout(&device, &forwarded()));
    }

    #[tokio::test]
    async fn test_realtime_publishes() {
        let publisher = MemoryPublisher::new();
        fan_out(&subscription("REALTIME"), &forwarded(), &publisher).await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "t");
        assert_eq!(published[0].pubsub_name, "ps");
        assert_eq!(published[0].content_type, "application/json");
    }

    #[tokio::test]
    async fn test_reserved_modes_do_not_publish() {
        let publisher = MemoryPublisher::new();
        fan_out(&subscription("ONCHANGED"), &forwarded(), &publisher).await.unwrap();
        fan_out(&subscription("PERIOD"), &forwarded(), &publisher).await.unwrap();
        assert!(publisher.published().is_empty());
    }
    /// Publisher whose broker is unreachable
    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl Publisher for Unreachable {
        async fn publish(
            &self,
            topic: &str,
            _pubsub_name: &str,
            _payload: Vec<u8>,
            _content_type: &str,
        ) -> Result<(), PublishError> {
            Err(PublishError::Failed {
                topic: topic.to_string(),
                reason: "connection refused".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_publish_failure_is_transient() {
        let err = fan_out(&subscription("REALTIME"), &forwarded(), &Unreachable)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::TransientIo(_)));
    }
}
