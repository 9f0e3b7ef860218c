//! Dot paths over JSON trees
//!
//! Paths are dot-separated segments. Array indices are numeric segments and
//! may also be written in brackets, so `a.0.b` and `a[0].b` are the same path.

use super::PatchError;
use serde_json::{Map, Value};

/// Split a path into segments, normalizing `[n]` into `.n`
pub fn segments(path: &str) -> Result<Vec<String>, PatchError> {
    let normalized = path.replace('[', ".").replace(']', "");
    if normalized.is_empty() {
        return Err(PatchError::InvalidPath(path.to_string()));
    }

    let segs: Vec<String> = normalized.split('.').map(str::to_string).collect();
    if segs.iter().any(String::is_empty) {
        return Err(PatchError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

/// Join segments back into canonical dot form
pub fn join(segs: &[String]) -> String {
    segs.join(".")
}

fn index_of(seg: &str) -> Option<usize> {
    seg.parse().ok()
}

fn child<'a>(node: &'a Value, seg: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => index_of(seg).and_then(|i| items.get(i)),
        _ => None,
    }
}

fn child_mut<'a>(node: &'a mut Value, seg: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => map.get_mut(seg),
        Value::Array(items) => index_of(seg).and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

pub fn get<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    segs.iter().try_fold(root, |node, seg| child(node, seg))
}

/// Number of leading segments that resolve to an existing node
pub fn existing_depth(root: &Value, segs: &[String]) -> usize {
    let mut node = root;
    for (depth, seg) in segs.iter().enumerate() {
        match child(node, seg) {
            Some(next) => node = next,
            None => return depth,
        }
    }
    segs.len()
}

/// Walk to the parent of the last segment, creating empty objects for
/// missing intermediates when `create` is set.
fn parent_mut<'a>(
    root: &'a mut Value,
    segs: &[String],
    create: bool,
) -> Result<&'a mut Value, PatchError> {
    let (_, parents) = segs
        .split_last()
        .ok_or_else(|| PatchError::InvalidPath(String::new()))?;

    let mut node = root;
    for (depth, seg) in parents.iter().enumerate() {
        let missing = child(node, seg).is_none();
        if missing {
            if !create {
                return Err(PatchError::MissingPath(join(&segs[..=depth])));
            }
            if node.is_null() {
                *node = Value::Object(Map::new());
            }
            let map = node
                .as_object_mut()
                .ok_or_else(|| PatchError::TypeMismatch(join(&segs[..depth])))?;
            map.insert(seg.clone(), Value::Object(Map::new()));
        }
        node = child_mut(node, seg)
            .ok_or_else(|| PatchError::TypeMismatch(join(&segs[..=depth])))?;
    }
    Ok(node)
}

/// Write `value` at the path
pub fn set(
    root: &mut Value,
    segs: &[String],
    value: Value,
    create: bool,
) -> Result<(), PatchError> {
    let parent = parent_mut(root, segs, create)?;
    let leaf = &segs[segs.len() - 1];
    if create && parent.is_null() {
        *parent = Value::Object(Map::new());
    }

    match parent {
        Value::Object(map) => {
            map.insert(leaf.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = index_of(leaf).ok_or_else(|| PatchError::TypeMismatch(join(segs)))?;
            if index < items.len() {
                items[index] = value;
                Ok(())
            } else if index == items.len() {
                items.push(value);
                Ok(())
            } else {
                Err(PatchError::MissingPath(join(segs)))
            }
        }
        _ => Err(PatchError::TypeMismatch(join(&segs[..segs.len() - 1]))),
    }
}

/// Delete the node at the path; a missing path is a no-op
pub fn remove(root: &mut Value, segs: &[String]) -> Option<Value> {
    let (leaf, parents) = segs.split_last()?;
    let mut node = root;
    for seg in parents {
        node = child_mut(node, seg)?;
    }
    match node {
        Value::Object(map) => map.remove(leaf),
        Value::Array(items) => {
            let index = index_of(leaf)?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

/// Append to the collection at the path, creating it when missing
pub fn append(root: &mut Value, segs: &[String], value: Value) -> Result<(), PatchError> {
    match get_mut(root, segs) {
        Some(Value::Array(items)) => {
            items.push(value);
            return Ok(());
        }
        Some(Value::Null) | None => {}
        Some(_) => return Err(PatchError::TypeMismatch(join(segs))),
    }
    set(root, segs, Value::Array(vec![value]), true)
}

fn get_mut<'a>(root: &'a mut Value, segs: &[String]) -> Option<&'a mut Value> {
    let mut node = root;
    for seg in segs {
        node = child_mut(node, seg)?;
    }
    Some(node)
}

/// Deep-merge an object into the node at the path
pub fn merge(root: &mut Value, segs: &[String], value: &Value) -> Result<(), PatchError> {
    let Value::Object(patch) = value else {
        return Err(PatchError::InvalidMerge(join(segs)));
    };

    match get_mut(root, segs) {
        Some(Value::Object(target)) => {
            merge_objects(target, patch);
            return Ok(());
        }
        Some(Value::Null) | None => {}
        Some(_) => return Err(PatchError::TypeMismatch(join(segs))),
    }
    set(root, segs, value.clone(), true)
}

fn merge_objects(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
