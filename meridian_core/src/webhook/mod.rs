//! Webhook ingestion: an axum ingress that acknowledges deliveries
//! immediately, per-path FIFO queues, and a processor dispatch loop with
//! bounded retries.

pub mod ingress;
pub mod manager;
pub mod models;
pub mod processor;

pub use ingress::webhook_router;
pub use manager::ProcessorManager;
pub use models::{LifecycleInstant, WebhookEvent};
pub use processor::WebhookProcessor;
