use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Boolean expression deciding whether a raw record maps to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub query: String,
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            query: "true".to_string(),
        }
    }
}

/// A mapped field: either an expression over the record or a literal search
/// query object passed through to the catalog untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mapping {
    Expression(String),
    Search(serde_json::Value),
}

impl Mapping {
    pub fn expr(s: impl Into<String>) -> Self {
        Self::Expression(s.into())
    }
}

/// Per-field mapping expressions for one resource kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMappings {
    pub identifier: Mapping,
    pub blueprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub relations: BTreeMap<String, Mapping>,
}

/// Declarative mapping from a vendor resource kind to catalog entities.
/// Immutable once loaded for an event or resync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub kind: String,
    #[serde(default)]
    pub selector: Selector,
    pub entity: EntityMappings,
}

/// Per-record transform output, transient within one batch.
#[derive(Debug, Clone, Default)]
pub struct MappedEntity {
    pub entity: Option<crate::models::Entity>,
    pub did_pass_selector: bool,
    /// Field path -> the mapping expression that produced an absent value.
    pub misconfigurations: BTreeMap<String, String>,
}
