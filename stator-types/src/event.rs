//! Event envelope exchanged over the message bus
//!
//! An event is a typed envelope: an identifier, a timestamp, a callback
//! address, a string-to-string metadata map and one payload variant. The
//! metadata keys are shared with every producer and consumer on the bus, so
//! they live in [`meta`].

use crate::response::ResponseStatus;
use crate::{EntityId, EnvelopeError, PatchData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Metadata header keys
pub mod meta {
    pub const TTL: &str = "x-msg-ttl";
    pub const TYPE: &str = "x-msg-type";
    pub const TOPIC: &str = "x-msg-topic";
    pub const ENTITY_ID: &str = "x-msg-en-id";
    pub const ENTITY_TYPE: &str = "x-msg-en-type";
    pub const OWNER: &str = "x-msg-owner";
    pub const SOURCE: &str = "x-msg-source";
    pub const VERSION: &str = "x-msg-version";
    pub const SENDER: &str = "x-msg-sender";
    pub const REQUEST_ID: &str = "x-msg-request-id";
    pub const RESPONSE_STATUS: &str = "x-msg-response-status";
    pub const RESPONSE_ERR_CODE: &str = "x-msg-response-errcode";
    pub const PATH_CONSTRUCTOR: &str = "x-msg-path-constructor";
    /// Number of mapper hops that led to this event
    pub const PROPAGATION_DEPTH: &str = "x-msg-propagation-depth";
}

/// Kind of event, stored under [`meta::TYPE`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "core.event.Cache")]
    Cache,
    #[serde(rename = "core.event.Entity")]
    Entity,
    #[serde(rename = "core.event.System")]
    System,
    #[serde(rename = "core.event.Callback")]
    Callback,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Cache => "core.event.Cache",
            EventType::Entity => "core.event.Entity",
            EventType::System => "core.event.System",
            EventType::Callback => "core.event.Callback",
        }
    }
}

impl FromStr for EventType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core.event.Cache" => Ok(EventType::Cache),
            "core.event.Entity" => Ok(EventType::Entity),
            "core.event.System" => Ok(EventType::System),
            "core.event.Callback" => Ok(EventType::Callback),
            _ => Err(EnvelopeError::UnknownLiteral {
                kind: "event type",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System operation carried by a system event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemOp {
    Create,
    Delete,
}

impl SystemOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemOp::Create => "core.event.System.Create",
            SystemOp::Delete => "core.event.System.Delete",
        }
    }
}

impl FromStr for SystemOp {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core.event.System.Create" => Ok(SystemOp::Create),
            "core.event.System.Delete" => Ok(SystemOp::Delete),
            _ => Err(EnvelopeError::UnknownLiteral {
                kind: "system op",
                value: s.to_string(),
            }),
        }
    }
}

/// How a Replace onto a missing path is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PathConstructor {
    /// Apply the node's configured missing-path policy
    #[default]
    Default,
    /// Synthesize intermediate structure and scheme definitions
    Scheme,
}

impl PathConstructor {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathConstructor::Default => "default",
            PathConstructor::Scheme => "scheme",
        }
    }
}

impl FromStr for PathConstructor {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" => Ok(PathConstructor::Default),
            "scheme" => Ok(PathConstructor::Scheme),
            _ => Err(EnvelopeError::UnknownLiteral {
                kind: "path constructor",
                value: s.to_string(),
            }),
        }
    }
}

/// Payload of a system event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemData {
    pub operator: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl SystemData {
    pub fn new(op: SystemOp, data: Option<Value>) -> Self {
        Self {
            operator: op.as_str().to_string(),
            data,
        }
    }

    pub fn op(&self) -> Result<SystemOp, EnvelopeError> {
        self.operator.parse()
    }
}

/// The oneof payload of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    RawData(Vec<u8>),
    Patches(Vec<PatchData>),
    SystemData(SystemData),
}

/// Typed event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Unix timestamp in nanoseconds
    pub timestamp: i64,
    #[serde(default)]
    pub callback: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub payload: Payload,
}

impl Event {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: crate::event_id(),
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            callback: String::new(),
            metadata: BTreeMap::new(),
            payload,
        }
    }

    /// An entity event carrying a patch batch (an empty batch is a read)
    pub fn patch_event(entity_id: &EntityId, patches: Vec<PatchData>) -> Self {
        Self::new(Payload::Patches(patches))
            .with_attr(meta::TYPE, EventType::Entity.as_str())
            .with_attr(meta::ENTITY_ID, entity_id.as_str())
    }

    /// A system event carrying a create/delete operation
    pub fn system_event(entity_id: &EntityId, op: SystemOp, data: Option<Value>) -> Self {
        Self::new(Payload::SystemData(SystemData::new(op, data)))
            .with_attr(meta::TYPE, EventType::System.as_str())
            .with_attr(meta::ENTITY_ID, entity_id.as_str())
    }

    /// A callback event answering the request `request_id`
    pub fn response_event(
        request_id: &str,
        status: ResponseStatus,
        err_code: &str,
        data: Vec<u8>,
    ) -> Self {
        Self::new(Payload::RawData(data))
            .with_attr(meta::TYPE, EventType::Callback.as_str())
            .with_attr(meta::REQUEST_ID, request_id)
            .with_attr(meta::RESPONSE_STATUS, status.as_str())
            .with_attr(meta::RESPONSE_ERR_CODE, err_code)
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = callback.into();
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Target entity, if the envelope names one
    pub fn entity(&self) -> Option<EntityId> {
        self.attr(meta::ENTITY_ID)
            .filter(|id| !id.is_empty())
            .map(EntityId::from)
    }

    pub fn event_type(&self) -> Result<EventType, EnvelopeError> {
        self.attr(meta::TYPE)
            .ok_or(EnvelopeError::MissingField(meta::TYPE))?
            .parse()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.attr(meta::REQUEST_ID).filter(|id| !id.is_empty())
    }

    /// Path-construction mode; absent means [`PathConstructor::Default`]
    pub fn path_constructor(&self) -> Result<PathConstructor, EnvelopeError> {
        self.attr(meta::PATH_CONSTRUCTOR).unwrap_or_default().parse()
    }

    pub fn propagation_depth(&self) -> u32 {
        self.attr(meta::PROPAGATION_DEPTH)
            .and_then(|depth| depth.parse().ok())
            .unwrap_or(0)
    }

    /// Patches of an entity event; raw and system payloads carry none
    pub fn patches(&self) -> &[PatchData] {
        match &self.payload {
            Payload::Patches(patches) => patches,
            Payload::RawData(_) | Payload::SystemData(_) => &[],
        }
    }

    pub fn system_data(&self) -> Option<&SystemData> {
        match &self.payload {
            Payload::SystemData(data) => Some(data),
            _ => None,
        }
    }

    pub fn raw_data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::RawData(data) => Some(data),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|err| EnvelopeError::Malformed(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|err| EnvelopeError::Malformed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_event_metadata() {
        let id = EntityId::new("device-1");
        let ev = Event::patch_event(&id, vec![PatchData::replace("properties.temp", json!(1))]);

        assert_eq!(ev.entity(), Some(id));
        assert_eq!(ev.event_type().unwrap(), EventType::Entity);
        assert_eq!(ev.patches().len(), 1);
        assert!(ev.system_data().is_none());
        assert_eq!(ev.path_constructor().unwrap(), PathConstructor::Default);
        assert_eq!(ev.propagation_depth(), 0);
    }

    #[test]
    fn test_unknown_path_constructor_is_rejected() {
        let ev = Event::patch_event(&EntityId::new("e"), vec![])
            .with_attr(meta::PATH_CONSTRUCTOR, "magic");
        assert!(matches!(
            ev.path_constructor(),
            Err(EnvelopeError::UnknownLiteral { .. })
        ));
    }

    #[test]
    fn test_system_event() {
        let ev = Event::system_event(&EntityId::new("e"), SystemOp::Delete, None);
        assert_eq!(ev.event_type().unwrap(), EventType::System);
        assert_eq!(ev.system_data().unwrap().op().unwrap(), SystemOp::Delete);
        assert!(ev.patches().is_empty());
    }

    #[test]
    fn test_encode_decode() {
        let ev = Event::system_event(
            &EntityId::new("e"),
            SystemOp::Create,
            Some(json!({"properties": {"temp": 20}})),
        )
        .with_callback("http://127.0.0.1:6789/v1/respond");

        let bytes = ev.encode().unwrap();
        assert_eq!(Event::decode(&bytes).unwrap(), ev);
        assert!(Event::decode(b"{not json").is_err());
    }
}
