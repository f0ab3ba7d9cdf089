use std::collections::{BTreeMap, BTreeSet};

use crate::models::Entity;
use crate::{Error, Result};

/// Order a batch so every relation target precedes the entities that refer
/// to it. Relations pointing outside the batch are ignored; the catalog
/// already holds those targets.
///
/// Returns [`Error::CyclicRelations`] when the relation graph has a cycle.
/// Apply the upserts unordered with the explicit cycle-resolution flags in
/// that case.
pub fn order_by_dependencies(entities: Vec<Entity>) -> Result<Vec<Entity>> {
    let mut index_of: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, entity) in entities.iter().enumerate() {
        if let Some(identifier) = entity.identifier.as_literal() {
            index_of.insert(identifier, i);
        }
    }

    // edges[target] -> referrers, in-degree counts incoming targets.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entities.len()];
    let mut in_degree: Vec<usize> = vec![0; entities.len()];
    for (i, entity) in entities.iter().enumerate() {
        let mut targets: BTreeSet<usize> = BTreeSet::new();
        for target in entity.relation_targets() {
            if let Some(&t) = index_of.get(target.as_str()) {
                if t != i {
                    targets.insert(t);
                }
            }
        }
        for t in targets {
            dependents[t].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: Vec<usize> = (0..entities.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order: Vec<usize> = Vec::with_capacity(entities.len());
    while let Some(i) = ready.pop() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push(d);
            }
        }
    }

    if order.len() != entities.len() {
        let stuck: Vec<&str> = entities
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .filter_map(|(_, e)| e.identifier.as_literal())
            .take(5)
            .collect();
        return Err(Error::CyclicRelations {
            hint: format!("entities involved: {}", stuck.join(", ")),
        });
    }

    let mut slots: Vec<Option<Entity>> = entities.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    for i in order {
        if let Some(entity) = slots[i].take() {
            ordered.push(entity);
        }
    }
    Ok(ordered)
}
