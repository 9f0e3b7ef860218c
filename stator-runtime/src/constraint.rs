//! Constraint tree and scheme index
//!
//! An entity's `scheme` maps each top-level property to a [`SchemeConfig`].
//! The configs form a tree (`define.fields` for structs, `define.elem_type`
//! for arrays). [`ConstraintNode`] mirrors that tree with enable flags and
//! operators, and [`SchemeIndex`] derives the search and time-series index
//! paths from it.
//!
//! An index is built once and never mutated; a scheme change builds a new
//! one that replaces the old behind an `Arc`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Flush to the search index on write
pub const OP_SEARCH_FLUSH: &str = "searchCB";
/// Flush to the time-series store on write
pub const OP_TSERIES_FLUSH: &str = "timeseriesCB";
/// Convert the value before storing
pub const OP_TYPE_CONVERT: &str = "convert";

const DEFINE_FIELDS: &str = "fields";
const DEFINE_ELEM_TYPE: &str = "elem_type";

/// Property configuration as stored in an entity's scheme
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeConfig {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub enabled_search: bool,
    #[serde(default)]
    pub enabled_time_series: bool,
    #[serde(default)]
    pub define: Map<String, Value>,
    #[serde(default)]
    pub last_time: i64,
}

impl SchemeConfig {
    /// Definition created by scheme-aware path construction
    pub fn synthesized(id: &str, kind: &str, now_ms: i64) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            name: id.to_string(),
            enabled: true,
            enabled_search: true,
            enabled_time_series: true,
            define: Map::new(),
            last_time: now_ms,
        }
    }
}

/// Enable flags of one constraint node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub self_enabled: bool,
    pub search: bool,
    pub time_series: bool,
}

/// Named callback with its condition payload
#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub callback: String,
    pub condition: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Leaf,
    Struct(Vec<ConstraintNode>),
    Array(Box<ConstraintNode>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintNode {
    pub id: String,
    pub kind_name: String,
    pub flags: Flags,
    pub operators: Vec<Operator>,
    pub kind: NodeKind,
}

impl ConstraintNode {
    /// Build a node from a config value. Malformed configs yield `None`.
    pub fn from_value(id: &str, value: &Value) -> Option<Self> {
        let mut config: SchemeConfig = serde_json::from_value(value.clone()).ok()?;
        if config.id.is_empty() {
            config.id = id.to_string();
        }
        Some(Self::from_config(&config))
    }

    pub fn from_config(config: &SchemeConfig) -> Self {
        let kind = match config.kind.as_str() {
            "struct" => {
                let children = config
                    .define
                    .get(DEFINE_FIELDS)
                    .and_then(Value::as_object)
                    .map(|fields| {
                        fields
                            .iter()
                            .filter_map(|(id, value)| ConstraintNode::from_value(id, value))
                            .collect()
                    })
                    .unwrap_or_default();
                NodeKind::Struct(children)
            }
            "array" => match config
                .define
                .get(DEFINE_ELEM_TYPE)
                .and_then(|elem| ConstraintNode::from_value("", elem))
            {
                Some(elem) => NodeKind::Array(Box::new(elem)),
                None => NodeKind::Leaf,
            },
            _ => NodeKind::Leaf,
        };

        let operators = config
            .define
            .iter()
            .filter(|(key, _)| key.as_str() != DEFINE_FIELDS && key.as_str() != DEFINE_ELEM_TYPE)
            .map(|(key, value)| Operator {
                callback: key.clone(),
                condition: value.clone(),
            })
            .collect();

        Self {
            id: config.id.clone(),
            kind_name: config.kind.clone(),
            flags: Flags {
                self_enabled: config.enabled,
                search: config.enabled_search,
                time_series: config.enabled_time_series,
            },
            operators,
            kind,
        }
    }

    fn children(&self) -> Vec<&ConstraintNode> {
        match &self.kind {
            NodeKind::Leaf => Vec::new(),
            NodeKind::Struct(children) => children.iter().collect(),
            NodeKind::Array(elem) => vec![elem.as_ref()],
        }
    }

    fn collect(&self, prefix: &str, pick: fn(&Flags) -> bool, out: &mut Vec<String>) {
        if !self.flags.self_enabled {
            return;
        }

        let path = match (prefix.is_empty(), self.id.is_empty()) {
            (true, _) => self.id.clone(),
            (false, true) => prefix.to_string(),
            (false, false) => format!("{}.{}", prefix, self.id),
        };
        if pick(&self.flags) && !path.is_empty() {
            out.push(path.clone());
        }
        for child in self.children() {
            child.collect(&path, pick, out);
        }
    }

    /// Search-indexable paths; a node with `self` disabled hides its subtree
    pub fn gen_search_index(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect("", |flags| flags.search, &mut out);
        out
    }

    /// Time-series-indexable paths
    pub fn gen_tseries_index(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect("", |flags| flags.time_series, &mut out);
        out
    }

    pub fn has_operator(&self, callback: &str) -> bool {
        self.operators.iter().any(|op| op.callback == callback)
    }
}

/// Index paths derived from one entity's scheme
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemeIndex {
    nodes: BTreeMap<String, ConstraintNode>,
    search: Vec<String>,
    time_series: Vec<String>,
}

impl SchemeIndex {
    pub fn build(scheme: &Value) -> Arc<Self> {
        let mut index = SchemeIndex::default();
        if let Value::Object(configs) = scheme {
            for (id, value) in configs {
                if let Some(node) = ConstraintNode::from_value(id, value) {
                    index.search.extend(node.gen_search_index());
                    index.time_series.extend(node.gen_tseries_index());
                    index.nodes.insert(id.clone(), node);
                }
            }
        }
        index.search.sort();
        index.time_series.sort();
        Arc::new(index)
    }

    pub fn search_index(&self) -> &[String] {
        &self.search
    }

    pub fn tseries_index(&self) -> &[String] {
        &self.time_series
    }

    pub fn node(&self, id: &str) -> Option<&ConstraintNode> {
        self.nodes.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
