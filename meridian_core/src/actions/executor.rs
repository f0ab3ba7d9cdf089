use std::time::Duration;

use async_trait::async_trait;

use super::models::ActionRun;
use crate::Result;

/// Reported when an executor's upstream API budget is nearly exhausted.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitState {
    /// Time until the budget resets.
    pub remaining: Duration,
}

/// Executes runs of one action type against the downstream system.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// The action type this executor handles; runs are routed by it.
    fn action_type(&self) -> &str;

    /// Optional ordering key. Runs sharing (action type, partition key)
    /// execute sequentially in claim order; everything else may interleave.
    fn partition_key(&self, _run: &ActionRun) -> Option<String> {
        None
    }

    /// Checked before each execution. Returning `Some` makes the worker
    /// wait out (part of) the remaining window before running.
    async fn is_close_to_rate_limit(&self) -> Option<RateLimitState> {
        None
    }

    /// Perform the action. The returned string becomes the run's terminal
    /// summary.
    async fn execute(&self, run: &ActionRun) -> Result<String>;
}
