//! Patch-based entity state
//!
//! A [`PatchEntity`] owns one entity's state tree and applies ordered patch
//! batches to it. A batch runs against a working copy that replaces the
//! canonical state only when every patch succeeded; a failed batch leaves the
//! entity untouched and reports both the error and the changes accumulated
//! before the failure.
//!
//! The entity has no concurrency of its own. Its owning state machine is the
//! only code that ever touches it.

mod construct;
pub mod path;

pub use construct::infer_type;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stator_types::{field, EntityId, EntityRecord, PatchData, PatchOp, PathConstructor};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while applying a patch
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
    #[error("invalid patch path {0:?}")]
    InvalidPath(String),

    #[error("path {0:?} does not exist")]
    MissingPath(String),

    #[error("field {0:?} is immutable")]
    ImmutableField(String),

    #[error("type mismatch at {0:?}")]
    TypeMismatch(String),

    #[error("merge value for {0:?} is not an object")]
    InvalidMerge(String),

    #[error("decode entity state: {0}")]
    Decode(String),
}

/// What a default-mode Replace does when the parent chain is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPathPolicy {
    /// Fail the batch with [`PatchError::MissingPath`]
    #[default]
    Reject,
    /// Skip the patch without recording a change
    Ignore,
    /// Create intermediate objects, without scheme definitions
    Create,
}

/// Source of modification timestamps (milliseconds)
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        ManualClock(AtomicI64::new(start))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of applying one patch batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchOutcome {
    /// Field-granular change records, in application order
    pub changes: Vec<PatchData>,
    /// Set when the batch failed; `changes` are then not committed
    pub error: Option<PatchError>,
}

impl PatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Whether any change landed under `scheme`
    pub fn touches_scheme(&self) -> bool {
        touches_scheme(&self.changes)
    }
}

/// Whether any of `changes` landed under `scheme`
pub fn touches_scheme(changes: &[PatchData]) -> bool {
    changes
        .iter()
        .any(|change| change.path == field::SCHEME || change.path.starts_with("scheme."))
}

/// One entity's state tree
#[derive(Debug, Clone)]
pub struct PatchEntity {
    id: EntityId,
    state: Value,
    policy: DefaultPathPolicy,
    clock: Arc<dyn Clock>,
}

impl PatchEntity {
    /// Fresh entity seeded from a parsed record
    pub fn from_record(record: EntityRecord, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: record.id.clone(),
            state: record.into_state(),
            policy: DefaultPathPolicy::default(),
            clock,
        }
    }

    /// Entity restored from a persisted snapshot
    pub fn from_raw(id: &EntityId, raw: &[u8], clock: Arc<dyn Clock>) -> Result<Self, PatchError> {
        let mut state: Value =
            serde_json::from_slice(raw).map_err(|err| PatchError::Decode(err.to_string()))?;
        let Value::Object(map) = &mut state else {
            return Err(PatchError::Decode("entity state must be an object".into()));
        };

        map.insert(field::ID.to_string(), Value::String(id.to_string()));
        for key in [field::PROPERTIES, field::SCHEME] {
            let slot = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
        }

        Ok(Self {
            id: id.clone(),
            state,
            policy: DefaultPathPolicy::default(),
            clock,
        })
    }

    pub fn with_policy(mut self, policy: DefaultPathPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    fn text(&self, key: &str) -> &str {
        self.state.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    fn number(&self, key: &str) -> i64 {
        match self.state.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
            Some(Value::String(s)) => s.parse().unwrap_or_default(),
            _ => 0,
        }
    }

    pub fn entity_type(&self) -> &str {
        self.text(field::TYPE)
    }

    pub fn owner(&self) -> &str {
        self.text(field::OWNER)
    }

    pub fn source(&self) -> &str {
        self.text(field::SOURCE)
    }

    pub fn template_id(&self) -> &str {
        self.text(field::TEMPLATE)
    }

    pub fn version(&self) -> i64 {
        self.number(field::VERSION)
    }

    pub fn last_time(&self) -> i64 {
        self.number(field::LAST_TIME)
    }

    pub fn properties(&self) -> &Value {
        self.state.get(field::PROPERTIES).unwrap_or(&Value::Null)
    }

    pub fn scheme(&self) -> &Value {
        self.state.get(field::SCHEME).unwrap_or(&Value::Null)
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Node at a dot path (`a.0.b` or `a[0].b`)
    pub fn get(&self, path: &str) -> Option<&Value> {
        let segs = path::segments(path).ok()?;
        path::get(&self.state, &segs)
    }

    pub fn get_prop(&self, key: &str) -> Option<&Value> {
        self.get(&format!("{}.{}", field::PROPERTIES, key))
    }

    /// State with empty scheme and properties
    pub fn basic(&self) -> Value {
        let mut basic = self.state.clone();
        if let Value::Object(map) = &mut basic {
            map.insert(field::SCHEME.to_string(), Value::Object(Map::new()));
            map.insert(field::PROPERTIES.to_string(), Value::Object(Map::new()));
        }
        basic
    }

    /// Basic fields and properties flattened into one object
    pub fn tiled(&self) -> Value {
        let mut tiled = self.state.clone();
        if let Value::Object(map) = &mut tiled {
            map.remove(field::SCHEME);
            map.remove(field::PROPERTIES);
            if let Value::Object(props) = self.properties() {
                for (key, value) in props {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        tiled
    }

    /// JSON encoding of the state
    pub fn raw(&self) -> Vec<u8> {
        serde_json::to_vec(&self.state).unwrap_or_default()
    }

    /// Apply a batch in order.
    ///
    /// An empty batch is a no-op and does not bump the version. A successful
    /// non-empty batch increments `version` by one and stamps `last_time`.
    pub fn handle(&mut self, batch: &[PatchData], mode: PathConstructor) -> PatchOutcome {
        if batch.is_empty() {
            return PatchOutcome::default();
        }

        let mut work = self.state.clone();
        let mut changes = Vec::with_capacity(batch.len());
        for patch in batch {
            if let Err(err) = self.apply(&mut work, patch, mode, &mut changes) {
                return PatchOutcome {
                    changes,
                    error: Some(err),
                };
            }
        }

        let version = self.version() + 1;
        if let Value::Object(map) = &mut work {
            map.insert(field::VERSION.to_string(), Value::from(version));
            map.insert(field::LAST_TIME.to_string(), Value::from(self.clock.now_millis()));
        }
        self.state = work;

        PatchOutcome {
            changes,
            error: None,
        }
    }

    fn apply(
        &self,
        work: &mut Value,
        patch: &PatchData,
        mode: PathConstructor,
        changes: &mut Vec<PatchData>,
    ) -> Result<(), PatchError> {
        if patch.op == PatchOp::Copy {
            return Ok(());
        }

        let segs = path::segments(&patch.path)?;
        if segs[0] == field::ID {
            return Err(PatchError::ImmutableField(field::ID.to_string()));
        }
        let canonical = path::join(&segs);

        match patch.op {
            PatchOp::Copy => {}
            PatchOp::Add => {
                path::append(work, &segs, patch.value.clone())?;
                changes.push(PatchData::add(canonical, patch.value.clone()));
            }
            PatchOp::Remove => {
                if path::remove(work, &segs).is_some() {
                    changes.push(PatchData::remove(canonical));
                }
            }
            PatchOp::Merge => {
                path::merge(work, &segs, &patch.value)?;
                if let Value::Object(fields) = &patch.value {
                    for (key, value) in fields {
                        changes.push(PatchData::replace(
                            format!("{}.{}", canonical, key),
                            value.clone(),
                        ));
                    }
                }
            }
            PatchOp::Replace => self.replace(work, &segs, patch, mode, changes)?,
        }
        Ok(())
    }

    fn replace(
        &self,
        work: &mut Value,
        segs: &[String],
        patch: &PatchData,
        mode: PathConstructor,
        changes: &mut Vec<PatchData>,
    ) -> Result<(), PatchError> {
        let canonical = path::join(segs);
        let depth = path::existing_depth(work, segs);
        if depth + 1 >= segs.len() {
            path::set(work, segs, patch.value.clone(), false)?;
            changes.push(PatchData::replace(canonical, patch.value.clone()));
            return Ok(());
        }

        match (mode, self.policy) {
            (PathConstructor::Scheme, _) => {
                path::set(work, segs, patch.value.clone(), true)?;
                changes.push(PatchData::replace(canonical, patch.value.clone()));

                if segs[0] == field::PROPERTIES && segs.len() > 1 {
                    let synthesized = construct::synthesize(
                        work,
                        &segs[1..],
                        &patch.value,
                        self.clock.now_millis(),
                    )?;
                    if let Some((key, definition)) = synthesized {
                        changes.push(PatchData::replace(
                            format!("{}.{}", field::SCHEME, key),
                            definition,
                        ));
                    }
                }
            }
            (PathConstructor::Default, DefaultPathPolicy::Reject) => {
                return Err(PatchError::MissingPath(path::join(&segs[..=depth])));
            }
            (PathConstructor::Default, DefaultPathPolicy::Ignore) => {}
            (PathConstructor::Default, DefaultPathPolicy::Create) => {
                path::set(work, segs, patch.value.clone(), true)?;
                changes.push(PatchData::replace(canonical, patch.value.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> (PatchEntity, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut record = EntityRecord::new(EntityId::new("device-1"));
        record.entity_type = "device".into();
        record.owner = "admin".into();
        (PatchEntity::from_record(record, clock.clone()), clock)
    }

    #[test]
    fn test_replace_bumps_version_and_time() {
        let (mut en, clock) = entity();
        clock.set(5_000);

        let outcome = en.handle(
            &[PatchData::replace("properties.temp", json!(20))],
            PathConstructor::Default,
        );

        assert!(outcome.is_ok());
        assert_eq!(en.version(), 1);
        assert_eq!(en.last_time(), 5_000);
        assert_eq!(en.get_prop("temp"), Some(&json!(20)));
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (mut en, _) = entity();
        let before = en.raw();
        let outcome = en.handle(&[], PathConstructor::Default);
        assert!(outcome.is_ok());
        assert!(outcome.changes.is_empty());
        assert_eq!(en.raw(), before);
    }

    #[test]
    fn test_failed_batch_does_not_commit() {
        let (mut en, _) = entity();
        let outcome = en.handle(
            &[
                PatchData::replace("properties.temp", json!(1)),
                PatchData::replace("properties.a.b", json!(2)),
            ],
            PathConstructor::Default,
        );

        assert_eq!(outcome.error, Some(PatchError::MissingPath("properties.a".into())));
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(en.version(), 0);
        assert_eq!(en.get_prop("temp"), None);
    }

    #[test]
    fn test_default_path_policies() {
        let (en, _) = entity();
        let patch = [PatchData::replace("properties.a.b", json!(2))];

        let mut ignore = en.clone().with_policy(DefaultPathPolicy::Ignore);
        let outcome = ignore.handle(&patch, PathConstructor::Default);
        assert!(outcome.is_ok());
        assert!(outcome.changes.is_empty());
        assert_eq!(ignore.get("properties.a"), None);

        let mut create = en.with_policy(DefaultPathPolicy::Create);
        create.handle(&patch, PathConstructor::Default);
        assert_eq!(create.get("properties.a.b"), Some(&json!(2)));
        assert_eq!(create.scheme(), &json!({}));
    }

    #[test]
    fn test_scheme_construction() {
        let (mut en, _) = entity();
        let outcome = en.handle(
            &[PatchData::replace("properties.a.b.c", json!(3))],
            PathConstructor::Scheme,
        );

        assert!(outcome.is_ok());
        assert_eq!(en.get("properties.a.b.c"), Some(&json!(3)));
        assert!(en.get("properties.a.b").unwrap().is_object());
        assert!(outcome.touches_scheme());

        let a = &en.scheme()["a"];
        assert_eq!(a["enabled_search"], json!(true));
        assert_eq!(a["enabled_time_series"], json!(true));
        let b = &a["define"]["fields"]["b"];
        assert_eq!(b["enabled_search"], json!(true));
        assert_eq!(b["enabled_time_series"], json!(true));
        assert_eq!(b["define"]["fields"]["c"]["type"], json!("int"));
    }

    #[test]
    fn test_merge_decomposes_into_replaces() {
        let (mut en, _) = entity();
        let outcome = en.handle(
            &[PatchData::merge("properties.obj", json!({"x": 1, "y": 2}))],
            PathConstructor::Default,
        );

        assert_eq!(
            outcome.changes,
            vec![
                PatchData::replace("properties.obj.x", json!(1)),
                PatchData::replace("properties.obj.y", json!(2)),
            ]
        );
        assert_eq!(en.get_prop("obj"), Some(&json!({"x": 1, "y": 2})));
    }

    #[test]
    fn test_id_is_immutable() {
        let (mut en, _) = entity();
        let outcome = en.handle(&[PatchData::replace("id", json!("x"))], PathConstructor::Default);
        assert_eq!(outcome.error, Some(PatchError::ImmutableField("id".into())));
        assert_eq!(en.id().as_str(), "device-1");
    }

    #[test]
    fn test_copy_remove_add() {
        let (mut en, _) = entity();
        let outcome = en.handle(
            &[
                PatchData::new(PatchOp::Copy, "properties.x", json!(1)),
                PatchData::remove("properties.missing"),
                PatchData::add("properties.list", json!("a")),
                PatchData::add("properties.list", json!("b")),
            ],
            PathConstructor::Default,
        );
        assert!(outcome.is_ok());
        assert_eq!(outcome.changes.len(), 2);
        assert_eq!(en.get("properties.list[1]"), Some(&json!("b")));
        assert_eq!(en.version(), 1);
    }

    #[test]
    fn test_views() {
        let (mut en, _) = entity();
        en.handle(&[PatchData::replace("properties.temp", json!(7))], PathConstructor::Default);

        assert_eq!(en.basic()["properties"], json!({}));
        assert_eq!(en.basic()["type"], json!("device"));
        let tiled = en.tiled();
        assert_eq!(tiled["temp"], json!(7));
        assert!(tiled.get("properties").is_none());

        let restored = PatchEntity::from_raw(en.id(), &en.raw(), Arc::new(SystemClock)).unwrap();
        assert_eq!(restored.version(), 1);
        assert_eq!(restored.state(), en.state());
    }
}
