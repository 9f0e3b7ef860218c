//! Scheme synthesis for scheme-aware path construction
//!
//! When a Replace under `properties` creates missing structure, the matching
//! scheme definitions are created too. Existing definitions are left alone.

use super::PatchError;
use crate::constraint::SchemeConfig;
use serde_json::{Map, Value};
use stator_types::field;

/// Scheme type name for a JSON value
pub fn infer_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::Array(_) => "array",
        Value::Object(_) => "struct",
        Value::Null | Value::String(_) => "string",
    }
}

fn config_value(id: &str, kind: &str, now_ms: i64) -> Result<Value, PatchError> {
    serde_json::to_value(SchemeConfig::synthesized(id, kind, now_ms))
        .map_err(|err| PatchError::Decode(err.to_string()))
}

/// Ensure scheme definitions exist for every segment of a property path.
///
/// `prop_segs` is the path below `properties`. Returns the top-level scheme
/// key and its new definition when anything was created.
pub fn synthesize(
    state: &mut Value,
    prop_segs: &[String],
    leaf: &Value,
    now_ms: i64,
) -> Result<Option<(String, Value)>, PatchError> {
    let Some(root_seg) = prop_segs.first() else {
        return Ok(None);
    };
    let Value::Object(root) = state else {
        return Ok(None);
    };

    let scheme = root
        .entry(field::SCHEME.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if scheme.is_null() {
        *scheme = Value::Object(Map::new());
    }
    let Some(mut fields) = scheme.as_object_mut() else {
        return Ok(None);
    };

    let mut created = false;
    let last = prop_segs.len() - 1;
    for (depth, seg) in prop_segs.iter().enumerate() {
        let kind = if depth == last { infer_type(leaf) } else { "struct" };
        if !fields.contains_key(seg) {
            fields.insert(seg.clone(), config_value(seg, kind, now_ms)?);
            created = true;
        }
        if depth == last {
            break;
        }

        let Some(Value::Object(config)) = fields.get_mut(seg) else {
            break;
        };
        let define = config
            .entry("define".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(define) = define.as_object_mut() else {
            break;
        };
        let children = define
            .entry("fields".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(children) = children.as_object_mut() else {
            break;
        };
        fields = children;
    }

    if !created {
        return Ok(None);
    }
    let definition = state
        .get(field::SCHEME)
        .and_then(|scheme| scheme.get(root_seg))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(Some((root_seg.clone(), definition)))
}
