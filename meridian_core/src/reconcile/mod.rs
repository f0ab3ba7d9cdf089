//! Reconciler: converges the catalog toward a desired entity set by
//! diffing against current state, ordering writes by relation
//! dependencies, and applying upserts before deletes.

pub mod diff;
pub mod order;

use std::sync::Arc;

use crate::catalog::{CatalogClient, DeleteOptions, UpsertOptions};
use crate::models::Entity;
use crate::{Error, Result};

pub use diff::{diff_entities, EntityDiff};
pub use order::order_by_dependencies;

/// Planned operation counts for one reconcile pass.
#[derive(Debug, Default, Clone)]
pub struct ReconcileSummary {
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Deletes were withheld because an upsert failed for an
    /// infrastructure reason and the desired set may be incomplete.
    pub delete_phase_skipped: bool,
}

pub struct Reconciler {
    catalog: Arc<dyn CatalogClient>,
    upsert_options: UpsertOptions,
    delete_options: DeleteOptions,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            catalog,
            upsert_options: UpsertOptions::default(),
            delete_options: DeleteOptions::default(),
        }
    }

    pub fn with_options(
        catalog: Arc<dyn CatalogClient>,
        upsert_options: UpsertOptions,
        delete_options: DeleteOptions,
    ) -> Self {
        Self {
            catalog,
            upsert_options,
            delete_options,
        }
    }

    /// Converge one blueprint's entities toward `desired`.
    ///
    /// Upserts run first, targets before referrers. Deletes run afterwards,
    /// referrers before targets, and only when no upsert hit an
    /// infrastructure failure; a flaky catalog or network must never turn
    /// into a mass delete. Per-entity failures do not stop the pass; they
    /// are raised together at the end as [`Error::Aggregate`].
    #[tracing::instrument(level = "debug", skip_all, fields(blueprint, desired = desired.len()))]
    pub async fn reconcile(&self, blueprint: &str, desired: Vec<Entity>) -> Result<ReconcileSummary> {
        let current = self.catalog.search_entities(blueprint).await?;
        let plan = diff_entities(&current, &desired);

        let mut summary = ReconcileSummary {
            created: plan.created.len(),
            modified: plan.modified.len(),
            deleted: plan.deleted.len(),
            unchanged: plan.unchanged.len(),
            delete_phase_skipped: false,
        };

        let mut errors: Vec<Error> = Vec::new();

        let mut upserts = plan.created;
        upserts.extend(plan.modified);
        let upserts = match order_by_dependencies(upserts.clone()) {
            Ok(ordered) => ordered,
            Err(err @ Error::CyclicRelations { .. }) => {
                tracing::error!(blueprint, error = %err, "relation cycle detected, applying upserts unordered");
                errors.push(err);
                upserts
            }
            Err(other) => return Err(other),
        };

        for entity in &upserts {
            if let Err(err) = self.catalog.upsert_entity(entity, &self.upsert_options).await {
                tracing::debug!(blueprint, error = %err, "entity upsert failed");
                errors.push(err);
            }
        }

        if errors.iter().any(Error::is_infrastructure) {
            summary.delete_phase_skipped = true;
            tracing::warn!(
                blueprint,
                withheld = summary.deleted,
                "skipping delete phase after infrastructure failure"
            );
        } else {
            let deletes = match order_by_dependencies(plan.deleted.clone()) {
                Ok(mut ordered) => {
                    ordered.reverse();
                    ordered
                }
                Err(err @ Error::CyclicRelations { .. }) => {
                    tracing::error!(blueprint, error = %err, "relation cycle detected, applying deletes unordered");
                    errors.push(err);
                    plan.deleted
                }
                Err(other) => return Err(other),
            };
            for entity in &deletes {
                if let Err(err) = self.catalog.delete_entity(entity, &self.delete_options).await {
                    tracing::debug!(blueprint, error = %err, "entity delete failed");
                    errors.push(err);
                }
            }
        }

        tracing::info!(
            blueprint,
            created = summary.created,
            modified = summary.modified,
            deleted = summary.deleted,
            unchanged = summary.unchanged,
            failures = errors.len(),
            delete_phase_skipped = summary.delete_phase_skipped,
            "reconcile pass finished"
        );

        if errors.is_empty() {
            Ok(summary)
        } else {
            Err(Error::Aggregate(
                errors.into_iter().map(|e| e.to_string()).collect(),
            ))
        }
    }
}
