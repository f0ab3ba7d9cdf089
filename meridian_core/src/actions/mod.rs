//! Self-service action execution: polls the remote run source under a
//! high-watermark, routes runs into ordered partitions, and reports
//! terminal results back.

pub mod executor;
pub mod manager;
pub mod models;
pub mod source;

pub use executor::{ActionExecutor, RateLimitState};
pub use manager::ActionManager;
pub use models::{ActionRun, RunPatch, RunStatus};
pub use source::{ActionRunSource, HttpActionRunSource};
