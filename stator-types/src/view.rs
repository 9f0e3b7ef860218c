//! Entity records and views

use crate::event::{meta, Event, SystemOp};
use crate::{EntityId, EnvelopeError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Reserved top-level fields of an entity state tree
pub mod field {
    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const OWNER: &str = "owner";
    pub const SOURCE: &str = "source";
    pub const VERSION: &str = "version";
    pub const LAST_TIME: &str = "last_time";
    pub const TEMPLATE: &str = "template_id";
    pub const SCHEME: &str = "scheme";
    pub const PROPERTIES: &str = "properties";
}

/// Entity as returned to API callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub id: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub last_time: i64,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub scheme: Value,
    #[serde(default)]
    pub mappers: Vec<MapperView>,
}

/// Mapper summary attached to an entity view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperView {
    pub id: String,
    pub name: String,
    pub tql: String,
    #[serde(default)]
    pub description: String,
}

/// Entity seed parsed from an inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub entity_type: String,
    pub owner: String,
    pub source: String,
    pub properties: Value,
    pub scheme: Value,
}

impl EntityRecord {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            entity_type: String::new(),
            owner: String::new(),
            source: String::new(),
            properties: Value::Object(Map::new()),
            scheme: Value::Object(Map::new()),
        }
    }

    /// Parse the entity seed from an event's metadata and, for a system
    /// create, its payload. Metadata wins over payload fields.
    pub fn from_event(ev: &Event) -> Result<Self, EnvelopeError> {
        let id = ev.entity().ok_or(EnvelopeError::MissingField(meta::ENTITY_ID))?;
        let mut record = Self::new(id);

        let create_data = ev
            .system_data()
            .filter(|sys| matches!(sys.op(), Ok(SystemOp::Create)))
            .and_then(|sys| sys.data.as_ref());
        if let Some(data) = create_data {
            let data = data
                .as_object()
                .ok_or_else(|| EnvelopeError::Malformed("create data must be an object".into()))?;
            let text = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default();
            record.entity_type = text(field::TYPE).to_string();
            record.owner = text(field::OWNER).to_string();
            record.source = text(field::SOURCE).to_string();
            if let Some(props) = data.get(field::PROPERTIES).filter(|v| v.is_object()) {
                record.properties = props.clone();
            }
            if let Some(scheme) = data.get(field::SCHEME).filter(|v| v.is_object()) {
                record.scheme = scheme.clone();
            }
        }

        let mut overlay = |key: &str, slot: &mut String| {
            if let Some(value) = ev.attr(key).filter(|v| !v.is_empty()) {
                *slot = value.to_string();
            }
        };
        overlay(meta::ENTITY_TYPE, &mut record.entity_type);
        overlay(meta::OWNER, &mut record.owner);
        overlay(meta::SOURCE, &mut record.source);

        Ok(record)
    }

    /// Initial state tree for this record
    pub fn into_state(self) -> Value {
        json!({
            "id": self.id.0,
            "type": self.entity_type,
            "owner": self.owner,
            "source": self.source,
            "version": 0,
            "last_time": 0,
            "properties": self.properties,
            "scheme": self.scheme,
        })
    }
}
