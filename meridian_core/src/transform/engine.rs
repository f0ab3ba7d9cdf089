use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::Value;

use super::expression::{CompiledExpression, ExpressionCache};
use super::models::{MappedEntity, Mapping, ResourceConfig};
use crate::config::SyncConfig;
use crate::models::{Entity, EntityValue};
use crate::{Error, Result};

/// Output of one batch transform.
#[derive(Debug, Default)]
pub struct TransformResult {
    /// Entities whose record passed the selector.
    pub passed: Vec<Entity>,
    /// Entities mapped in parse-all mode from records that failed the selector.
    pub failed: Vec<Entity>,
    /// Records that mapped to no usable identifier or blueprint.
    pub misconfigured_count: usize,
    /// Field path -> the mapping expression that produced an absent value.
    pub misconfigurations: BTreeMap<String, String>,
    /// Per-record recoverable failures (selector type errors etc.),
    /// collected rather than raised so one bad record never aborts a sync.
    pub errors: Vec<Error>,
    /// Size of each processed chunk, in order.
    pub chunk_sizes: Vec<usize>,
}

/// Evaluates resource mappings against raw record batches on a dedicated
/// CPU pool. Expression evaluation is interpreter-bound, so each record is
/// mapped end-to-end on the pool and only copy-safe inputs/outputs cross the
/// boundary.
pub struct TransformEngine {
    pool: Arc<rayon::ThreadPool>,
    cache: Arc<ExpressionCache>,
    chunk_size: usize,
}

#[derive(Clone)]
enum CompiledMapping {
    Expression(Arc<CompiledExpression>),
    Search(Value),
}

#[derive(Clone)]
struct CompiledMappings {
    kind: Arc<str>,
    selector: Arc<CompiledExpression>,
    identifier: CompiledMapping,
    blueprint: Arc<CompiledExpression>,
    title: Option<Arc<CompiledExpression>>,
    team: Option<Arc<CompiledExpression>>,
    properties: Vec<(String, Arc<CompiledExpression>)>,
    relations: Vec<(String, CompiledMapping)>,
}

impl TransformEngine {
    pub fn new(cfg: &SyncConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.transform_workers)
            .thread_name(|i| format!("meridian-transform-{i}"))
            .build()
            .map_err(|e| Error::backend("transform pool startup", e))?;
        Ok(Self {
            pool: Arc::new(pool),
            cache: Arc::new(ExpressionCache::new()),
            chunk_size: cfg.transform_chunk_size,
        })
    }

    pub fn cache(&self) -> &ExpressionCache {
        &self.cache
    }

    fn compile_mapping(&self, m: &Mapping) -> Result<CompiledMapping> {
        Ok(match m {
            Mapping::Expression(src) => CompiledMapping::Expression(self.cache.compile(src)?),
            Mapping::Search(query) => CompiledMapping::Search(query.clone()),
        })
    }

    fn compile(&self, config: &ResourceConfig) -> Result<CompiledMappings> {
        let mappings = &config.entity;
        Ok(CompiledMappings {
            kind: Arc::from(config.kind.as_str()),
            selector: self.cache.compile(&config.selector.query)?,
            identifier: self.compile_mapping(&mappings.identifier)?,
            blueprint: self.cache.compile(&mappings.blueprint)?,
            title: mappings
                .title
                .as_deref()
                .map(|src| self.cache.compile(src))
                .transpose()?,
            team: mappings
                .team
                .as_deref()
                .map(|src| self.cache.compile(src))
                .transpose()?,
            properties: mappings
                .properties
                .iter()
                .map(|(k, src)| Ok((k.clone(), self.cache.compile(src)?)))
                .collect::<Result<_>>()?,
            relations: mappings
                .relations
                .iter()
                .map(|(k, m)| Ok((k.clone(), self.compile_mapping(m)?)))
                .collect::<Result<_>>()?,
        })
    }

    /// Transform a batch of raw records for one resource kind.
    ///
    /// With `parse_all`, records failing the selector are still mapped (used
    /// by raw-data validation flows) and land in `failed`. Compile errors
    /// fail the whole batch fast; per-record evaluation errors are collected;
    /// a panic on the pool aborts the batch.
    #[tracing::instrument(level = "debug", skip(self, records), fields(kind = %config.kind, records = records.len()))]
    pub async fn transform(
        &self,
        config: &ResourceConfig,
        records: Vec<Value>,
        parse_all: bool,
    ) -> Result<TransformResult> {
        let compiled = self.compile(config)?;
        let mut result = TransformResult::default();

        for chunk in records.chunks(self.chunk_size.max(1)) {
            result.chunk_sizes.push(chunk.len());
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            for record in chunk.iter().cloned() {
                let tx = tx.clone();
                let compiled = compiled.clone();
                self.pool.spawn(move || {
                    let out = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        map_record(&compiled, &record, parse_all)
                    }));
                    let _ = tx.send(out);
                });
            }
            drop(tx);

            for _ in 0..chunk.len() {
                let out = rx
                    .recv()
                    .await
                    .ok_or_else(|| Error::message("transform pool hung up mid-chunk"))?;
                match out {
                    Ok(mapped) => collect(&mut result, mapped),
                    Err(_) => {
                        return Err(Error::message(
                            "transform worker panicked; aborting batch",
                        ));
                    }
                }
            }
        }

        if result.misconfigured_count > 0 {
            // One aggregated line for the whole batch, never one per fault.
            tracing::warn!(
                kind = %config.kind,
                misconfigured = result.misconfigured_count,
                misconfigurations = %serde_json::to_string(&result.misconfigurations)
                    .unwrap_or_default(),
                "records mapped to no identifier or blueprint and were skipped"
            );
        }
        Ok(result)
    }
}

fn collect(result: &mut TransformResult, mapped: Result<MappedEntity>) {
    match mapped {
        Ok(m) => {
            // A record with mapping faults counts as misconfigured whatever
            // its selector said; a faultless entity-less record was merely
            // filtered out.
            let faulted = !m.misconfigurations.is_empty();
            result.misconfigurations.extend(m.misconfigurations);
            match m.entity {
                Some(entity) if m.did_pass_selector => result.passed.push(entity),
                Some(entity) => result.failed.push(entity),
                None if faulted => result.misconfigured_count += 1,
                None => {}
            }
        }
        Err(err) => result.errors.push(err),
    }
}

fn value_to_identifier(v: Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn map_record(compiled: &CompiledMappings, record: &Value, parse_all: bool) -> Result<MappedEntity> {
    let did_pass_selector = compiled.selector.eval_selector(record, &compiled.kind)?;
    if !did_pass_selector && !parse_all {
        return Ok(MappedEntity::default());
    }

    let mut misconfigurations = BTreeMap::new();

    let identifier = match &compiled.identifier {
        CompiledMapping::Expression(expr) => match expr.eval(record).and_then(value_to_identifier)
        {
            Some(id) => Some(EntityValue::Literal(id)),
            None => {
                misconfigurations.insert("identifier".to_string(), expr.source().to_string());
                None
            }
        },
        CompiledMapping::Search(query) => Some(EntityValue::Search(query.clone())),
    };

    let blueprint = match compiled
        .blueprint
        .eval(record)
        .and_then(value_to_identifier)
    {
        Some(bp) => Some(bp),
        None => {
            misconfigurations.insert(
                "blueprint".to_string(),
                compiled.blueprint.source().to_string(),
            );
            None
        }
    };

    let (Some(identifier), Some(blueprint)) = (identifier, blueprint) else {
        return Ok(MappedEntity {
            entity: None,
            did_pass_selector,
            misconfigurations,
        });
    };

    let mut entity = Entity::new(identifier, blueprint)?;
    if let Some(expr) = &compiled.title {
        entity.title = expr.eval(record).and_then(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        });
    }
    if let Some(expr) = &compiled.team {
        entity.team = expr.eval(record);
    }
    for (key, expr) in &compiled.properties {
        match expr.eval(record) {
            Some(v) => {
                entity.properties.insert(key.clone(), v);
            }
            None => {
                misconfigurations
                    .insert(format!("properties.{key}"), expr.source().to_string());
            }
        }
    }
    for (key, mapping) in &compiled.relations {
        match mapping {
            CompiledMapping::Expression(expr) => match expr.eval(record) {
                Some(v) => {
                    entity.relations.insert(key.clone(), v);
                }
                None => {
                    misconfigurations
                        .insert(format!("relations.{key}"), expr.source().to_string());
                }
            },
            CompiledMapping::Search(query) => {
                entity.relations.insert(key.clone(), query.clone());
            }
        }
    }

    Ok(MappedEntity {
        entity: Some(entity),
        did_pass_selector,
        misconfigurations,
    })
}
