//! Newline-delimited JSON intake
//!
//! Each input line is either a raw event envelope, dispatched onto the bus
//! as is, or a command carrying an `op` field, run through the API manager
//! with its result printed as one JSON line.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use stator_manager::{ApiManager, PatchOptions};
use stator_mapper::MapperRecord;
use stator_runtime::{Dispatcher, MapperFilter};
use stator_types::{EntityId, EntityRecord, Event, PatchData};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Create {
        id: String,
        #[serde(rename = "type", default)]
        entity_type: String,
        #[serde(default)]
        owner: String,
        #[serde(default)]
        source: String,
        #[serde(default)]
        properties: Value,
    },
    Patch {
        id: String,
        patches: Vec<PatchData>,
        /// Build missing paths together with their scheme
        #[serde(default)]
        scheme: bool,
    },
    Get {
        id: String,
    },
    Delete {
        id: String,
    },
    AppendMapper {
        mapper: MapperRecord,
    },
    RemoveMapper {
        id: String,
    },
    ListMappers {
        #[serde(default)]
        entity_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Line {
    Command(Command),
    Event(Event),
}

pub fn parse(line: &str) -> Result<Line> {
    serde_json::from_str(line).context("Failed to parse input line")
}

/// Handle one input line; returns the output line for commands
pub async fn ingest(
    line: &str,
    manager: &ApiManager,
    bus: &dyn Dispatcher,
) -> Result<Option<Value>> {
    match parse(line)? {
        Line::Event(ev) => {
            bus.dispatch(ev).await?;
            Ok(None)
        }
        Line::Command(cmd) => Ok(Some(run(cmd, manager).await)),
    }
}

async fn run(cmd: Command, manager: &ApiManager) -> Value {
    let result = match cmd {
        Command::Create {
            id,
            entity_type,
            owner,
            source,
            properties,
        } => {
            let mut record = EntityRecord::new(EntityId::new(id));
            record.entity_type = entity_type;
            record.owner = owner;
            record.source = source;
            record.properties = match properties {
                Value::Null => Value::Object(Map::new()),
                other => other,
            };
            manager.create_entity(record).await.map(|view| json!(view))
        }
        Command::Patch { id, patches, scheme } => {
            let opts = if scheme {
                PatchOptions::scheme()
            } else {
                PatchOptions::default()
            };
            manager
                .patch_entity(&EntityId::new(id), patches, opts)
                .await
                .map(|view| json!(view))
        }
        Command::Get { id } => manager.get_entity(&EntityId::new(id)).await.map(|view| json!(view)),
        Command::Delete { id } => manager
            .delete_entity(&EntityId::new(id))
            .await
            .map(|()| json!({})),
        Command::AppendMapper { mapper } => manager.append_mapper(mapper).await.map(|()| json!({})),
        Command::RemoveMapper { id } => manager.remove_mapper(&id).await.map(|()| json!({})),
        Command::ListMappers { entity_id } => {
            let filter = MapperFilter {
                owner: None,
                entity_id: entity_id.map(EntityId::new),
            };
            manager.list_mappers(&filter).await.map(|records| json!(records))
        }
    };

    match result {
        Ok(data) => json!({"ok": true, "data": data}),
        Err(err) => json!({"ok": false, "code": err.remote_code(), "error": err.to_string()}),
    }
}
