//! Projection mappers
//!
//! The bundled compiler understands the projection subset of TQL:
//!
//! ```text
//! insert into <target> select <entity>.<path> [as <field>][, ...]
//! ```
//!
//! Each selected path becomes a tentacle on the source entity; each value is
//! written to `properties.<field>` of the target. A path that does not start
//! with `properties.` is taken relative to the source's properties.

use crate::{Mapper, MapperCompiler, MapperError, MapperInputs, MapperRecord, Tentacle, WatchKey};
use once_cell::sync::Lazy;
use regex::Regex;
use stator_types::{field, EntityId, PatchData};
use std::sync::Arc;

static STATEMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*insert\s+into\s+(\S+)\s+select\s+(.+?)\s*;?\s*$")
        .expect("valid statement regex")
});

static SELECT_ITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*([^\s.]+)\.([^\s]+?)(?:\s+as\s+([A-Za-z_][A-Za-z0-9_]*))?\s*$")
        .expect("valid select item regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
struct Projection {
    source: EntityId,
    path: String,
    field: String,
}

impl Projection {
    fn key(&self) -> WatchKey {
        WatchKey::new(&self.source, &self.path)
    }
}

/// Mapper copying watched values into fields of its target
#[derive(Debug, Clone)]
pub struct ProjectionMapper {
    id: String,
    target: EntityId,
    projections: Vec<Projection>,
}

impl ProjectionMapper {
    /// Parse a projection statement
    pub fn parse(id: &str, tql: &str) -> Result<Self, MapperError> {
        let caps = STATEMENT_RE
            .captures(tql)
            .ok_or_else(|| MapperError::compile(id, "expected `insert into <target> select ...`"))?;

        let target = EntityId::new(&caps[1]);
        let mut projections = Vec::new();
        for item in caps[2].split(',') {
            let item_caps = SELECT_ITEM_RE
                .captures(item)
                .ok_or_else(|| MapperError::compile(id, format!("bad select item {:?}", item.trim())))?;

            let raw_path = &item_caps[2];
            let path = if raw_path.starts_with("properties.") {
                raw_path.to_string()
            } else {
                format!("{}.{}", field::PROPERTIES, raw_path)
            };
            let field = match item_caps.get(3) {
                Some(alias) => alias.as_str().to_string(),
                None => raw_path.rsplit('.').next().unwrap_or(raw_path).to_string(),
            };

            projections.push(Projection {
                source: EntityId::new(&item_caps[1]),
                path,
                field,
            });
        }

        Ok(Self {
            id: id.to_string(),
            target,
            projections,
        })
    }
}

impl Mapper for ProjectionMapper {
    fn id(&self) -> &str {
        &self.id
    }

    fn target(&self) -> &EntityId {
        &self.target
    }

    fn tentacles(&self) -> Vec<Tentacle> {
        self.projections
            .iter()
            .map(|p| Tentacle::new(self.id.clone(), p.source.clone(), p.path.clone()))
            .collect()
    }

    fn exec(&self, inputs: &MapperInputs) -> Result<Vec<PatchData>, MapperError> {
        let patches: Vec<PatchData> = self
            .projections
            .iter()
            .filter_map(|p| {
                inputs.get(&p.key()).map(|value| {
                    PatchData::replace(format!("{}.{}", field::PROPERTIES, p.field), value.clone())
                })
            })
            .collect();

        if patches.is_empty() {
            return Err(MapperError::MissingInput(self.id.clone()));
        }
        Ok(patches)
    }
}

/// Compiler for projection statements
#[derive(Debug, Default, Clone)]
pub struct ProjectionCompiler;

impl ProjectionCompiler {
    pub fn new() -> Self {
        ProjectionCompiler
    }
}

impl MapperCompiler for ProjectionCompiler {
    fn compile(&self, record: &MapperRecord) -> Result<Arc<dyn Mapper>, MapperError> {
        let mapper = ProjectionMapper::parse(&record.id, &record.tql)?;
        if mapper.target != record.entity_id {
            return Err(MapperError::compile(
                &record.id,
                format!(
                    "target {} does not match mapper entity {}",
                    mapper.target, record.entity_id
                ),
            ));
        }
        Ok(Arc::new(mapper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_prefixes_bare_paths() {
        let mapper =
            ProjectionMapper::parse("m1", "INSERT INTO agg SELECT dev1.temp AS t, dev2.properties.a.b")
                .unwrap();

        assert_eq!(mapper.target(), &EntityId::new("agg"));
        let tentacles = mapper.tentacles();
        assert_eq!(tentacles[0].key().as_str(), "dev1#properties.temp");
        assert_eq!(tentacles[1].key().as_str(), "dev2#properties.a.b");
        assert_eq!(mapper.projections[1].field, "b");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            ProjectionMapper::parse("m1", "select * from x"),
            Err(MapperError::Compile { .. })
        ));
        assert!(ProjectionMapper::parse("m1", "insert into agg select temp").is_err());
    }

    #[test]
    fn test_exec_requires_some_input() {
        let mapper = ProjectionMapper::parse("m1", "insert into agg select dev1.temp as t").unwrap();
        assert_eq!(
            mapper.exec(&MapperInputs::new()),
            Err(MapperError::MissingInput("m1".into()))
        );

        let mut inputs = MapperInputs::new();
        inputs.insert(WatchKey::new(&EntityId::new("dev1"), "properties.temp"), json!(7));
        assert_eq!(
            mapper.exec(&inputs).unwrap(),
            vec![PatchData::replace("properties.t", json!(7))]
        );
    }

    #[test]
    fn test_compile_checks_target() {
        let record = MapperRecord::new("m1", "admin", EntityId::new("other"), "insert into agg select dev1.temp");
        assert!(ProjectionCompiler::new().compile(&record).is_err());
    }
}
