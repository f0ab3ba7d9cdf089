use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::Entity;

/// Partition of a desired entity set against the catalog's current set,
/// keyed by (identifier, blueprint).
#[derive(Debug, Default)]
pub struct EntityDiff {
    pub created: Vec<Entity>,
    pub modified: Vec<Entity>,
    pub unchanged: Vec<Entity>,
    /// Entries come from the current set; they no longer appear in desired.
    pub deleted: Vec<Entity>,
}

/// Compare desired entities against the current catalog state.
///
/// Entities carrying search-query identifiers or relations cannot be keyed
/// locally, so they always land in `modified` and are resolved catalog-side
/// on upsert.
pub fn diff_entities(current: &[Entity], desired: &[Entity]) -> EntityDiff {
    let mut current_by_key: BTreeMap<(String, String), &Entity> = BTreeMap::new();
    for entity in current {
        if let Some(key) = entity.key() {
            current_by_key.insert(key, entity);
        }
    }

    let mut out = EntityDiff::default();
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();

    for entity in desired {
        if entity.is_using_search_identifier() || entity.is_using_search_relation() {
            out.modified.push(entity.clone());
            continue;
        }
        let Some(key) = entity.key() else {
            out.modified.push(entity.clone());
            continue;
        };
        seen.insert(key.clone());
        match current_by_key.get(&key) {
            None => out.created.push(entity.clone()),
            Some(existing) => {
                if entities_differ(existing, entity) {
                    out.modified.push(entity.clone());
                } else {
                    out.unchanged.push(entity.clone());
                }
            }
        }
    }

    for (key, entity) in &current_by_key {
        if !seen.contains(key) {
            out.deleted.push((*entity).clone());
        }
    }

    out
}

fn entities_differ(current: &Entity, desired: &Entity) -> bool {
    if current.title != desired.title {
        return true;
    }
    if !team_equal(&current.team, &desired.team) {
        return true;
    }
    map_hash(&current.properties, &desired.properties)
        != map_hash(&desired.properties, &current.properties)
        || map_hash(&current.relations, &desired.relations)
            != map_hash(&desired.relations, &current.relations)
}

/// Team membership is a set: list order must not register as a change.
fn team_equal(a: &Option<Value>, b: &Option<Value>) -> bool {
    match (normalize_team(a), normalize_team(b)) {
        (Some(x), Some(y)) => x == y,
        (None, None) => true,
        _ => false,
    }
}

fn normalize_team(team: &Option<Value>) -> Option<Value> {
    match team {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let mut sorted: Vec<String> = items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect();
            sorted.sort();
            Some(Value::from(sorted))
        }
        Some(other) => Some(other.clone()),
    }
}

/// Content hash of a field map, computed after dropping keys that are null
/// here and wholly absent on the other side. A mapping that stops emitting a
/// field (null) compares equal to a catalog that never stored it.
fn map_hash(map: &BTreeMap<String, Value>, other: &BTreeMap<String, Value>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in map {
        if value.is_null() && !other.contains_key(key) {
            continue;
        }
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        // BTreeMap-backed serde_json keeps nested object keys sorted, so the
        // serialization is deterministic.
        hasher.update(value.to_string().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
