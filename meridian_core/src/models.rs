use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// An entity identifier or relation value.
///
/// Most values are literal strings, but either may instead carry a "search"
/// query object that the catalog resolves server-side. Entities carrying a
/// search value are never diffed by content, only ever upserted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityValue {
    Literal(String),
    Search(serde_json::Value),
}

impl EntityValue {
    pub fn is_search(&self) -> bool {
        matches!(self, Self::Search(_))
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(s) => Some(s),
            Self::Search(_) => None,
        }
    }
}

impl From<&str> for EntityValue {
    fn from(s: &str) -> Self {
        Self::Literal(s.to_string())
    }
}

impl From<String> for EntityValue {
    fn from(s: String) -> Self {
        Self::Literal(s)
    }
}

/// A typed record in the catalog.
///
/// Equality for diffing is `(identifier, blueprint)`; content equality is
/// decided by the reconciler over normalized properties and relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub identifier: EntityValue,
    pub blueprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Literal string, list of strings, or search query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<serde_json::Value>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Relation values: string, list of strings, search object, or null.
    #[serde(default)]
    pub relations: BTreeMap<String, serde_json::Value>,
}

impl Entity {
    pub fn new(identifier: impl Into<EntityValue>, blueprint: impl Into<String>) -> Result<Self> {
        let blueprint = blueprint.into();
        if blueprint.trim().is_empty() {
            return Err(Error::InvalidInput("entity blueprint is empty".to_string()));
        }
        let identifier = identifier.into();
        if matches!(&identifier, EntityValue::Literal(s) if s.trim().is_empty()) {
            return Err(Error::InvalidInput(
                "entity identifier is empty".to_string(),
            ));
        }
        Ok(Self {
            identifier,
            blueprint,
            title: None,
            team: None,
            properties: BTreeMap::new(),
            relations: BTreeMap::new(),
        })
    }

    /// Diff key. `None` when the identifier is a search query, since such
    /// entities bypass diffing entirely.
    pub fn key(&self) -> Option<(String, String)> {
        self.identifier
            .as_literal()
            .map(|id| (id.to_string(), self.blueprint.clone()))
    }

    pub fn is_using_search_identifier(&self) -> bool {
        self.identifier.is_search()
    }

    /// A relation value expressed as an object is a search query.
    pub fn is_using_search_relation(&self) -> bool {
        self.relations.values().any(|v| v.is_object())
    }

    /// Literal identifiers this entity's relations point at, used for
    /// dependency ordering. Search relations contribute nothing.
    pub fn relation_targets(&self) -> Vec<String> {
        let mut out = Vec::new();
        for value in self.relations.values() {
            match value {
                serde_json::Value::String(s) => out.push(s.clone()),
                serde_json::Value::Array(items) => {
                    out.extend(items.iter().filter_map(|v| v.as_str().map(String::from)));
                }
                _ => {}
            }
        }
        out
    }
}

/// The type/schema an entity instantiates. Owned by the catalog; fetched
/// read-only when relation metadata is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub schema: serde_json::Value,
    #[serde(default)]
    pub relations: BTreeMap<String, serde_json::Value>,
}
