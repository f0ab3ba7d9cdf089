//! Synchronization pipeline for catalog integrations.
//!
//! The crate is organized around four cooperating subsystems:
//!
//! - [`queue`]: FIFO work queues with commit semantics, in memory, grouped
//!   by ordering key, or persisted to SQLite.
//! - [`webhook`]: an ingress that acknowledges deliveries immediately and a
//!   per-path processing loop with bounded retries.
//! - [`actions`]: a poller and worker pool executing self-service action
//!   runs claimed from a remote source.
//! - [`transform`] and [`reconcile`]: mapping raw vendor records into
//!   entities on a CPU pool, then converging the catalog toward the mapped
//!   set with ordered upserts and a guarded delete phase.

#![forbid(unsafe_code)]

pub mod actions;
pub mod catalog;
pub mod config;
pub mod error;
pub mod models;
pub mod queue;
pub mod reconcile;
pub mod transform;
pub mod webhook;

pub use catalog::{CatalogClient, DeleteOptions, HttpCatalogClient, UpsertOptions};
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{Blueprint, Entity, EntityValue};
pub use reconcile::{ReconcileSummary, Reconciler};
pub use transform::{ResourceConfig, TransformEngine, TransformResult};
