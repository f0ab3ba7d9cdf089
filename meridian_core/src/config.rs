use crate::{Error, Result};

/// Tunables for the synchronization pipeline.
///
/// One instance is shared (by clone) across the queue, webhook and action
/// subsystems so tests can shrink every interval without touching globals.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum total action runs allowed across all queues before the poller
    /// pauses.
    pub runs_high_watermark: usize,
    pub runs_poll_interval_ms: u64,
    /// Visibility timeout passed to the remote run source on claim; a crash
    /// mid-execution returns the run to pending once it elapses externally.
    pub runs_visibility_timeout_secs: u64,
    pub action_workers: usize,
    /// Cap on a single rate-limit backoff sleep.
    pub rate_limit_backoff_cap_secs: u64,
    pub shutdown_max_wait_ms: u64,

    /// Hard wall-clock budget for one webhook event, retries included.
    pub webhook_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub retry_backoff_max_ms: u64,

    /// Locks older than this are considered abandoned by a crashed worker.
    pub group_lock_timeout_secs: u64,
    pub group_sweep_interval_ms: u64,

    pub disk_poll_interval_ms: u64,
    pub disk_claim_visibility_secs: u64,
    pub disk_pool_connections: u32,

    pub transform_workers: usize,
    pub transform_chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            runs_high_watermark: 20,
            runs_poll_interval_ms: 5_000,
            runs_visibility_timeout_secs: 60,
            action_workers: 5,
            rate_limit_backoff_cap_secs: 60,
            shutdown_max_wait_ms: 30_000,
            webhook_timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_base_ms: 500,
            retry_backoff_multiplier: 2.0,
            retry_backoff_max_ms: 30_000,
            group_lock_timeout_secs: 300,
            group_sweep_interval_ms: 5_000,
            disk_poll_interval_ms: 200,
            disk_claim_visibility_secs: 300,
            disk_pool_connections: cpus as u32,
            transform_workers: cpus,
            transform_chunk_size: 100,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runs_high_watermark == 0 {
            return Err(Error::message("runs_high_watermark must be > 0"));
        }
        if self.runs_poll_interval_ms == 0 {
            return Err(Error::message("runs_poll_interval_ms must be > 0"));
        }
        if self.action_workers == 0 {
            return Err(Error::message("action_workers must be > 0"));
        }
        if self.webhook_timeout_ms == 0 {
            return Err(Error::message("webhook_timeout_ms must be > 0"));
        }
        if self.retry_backoff_base_ms == 0 {
            return Err(Error::message("retry_backoff_base_ms must be > 0"));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(Error::message("retry_backoff_multiplier must be >= 1.0"));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            return Err(Error::message(
                "retry_backoff_max_ms must be >= retry_backoff_base_ms",
            ));
        }
        if self.group_lock_timeout_secs == 0 {
            return Err(Error::message("group_lock_timeout_secs must be > 0"));
        }
        if self.disk_pool_connections == 0 {
            return Err(Error::message("disk_pool_connections must be > 0"));
        }
        if self.transform_workers == 0 {
            return Err(Error::message("transform_workers must be > 0"));
        }
        if self.transform_chunk_size == 0 {
            return Err(Error::message("transform_chunk_size must be > 0"));
        }
        Ok(())
    }

    /// Exponential backoff: base * multiplier^attempt, capped.
    pub fn retry_backoff_ms(&self, attempt: u32) -> u64 {
        let exp = self.retry_backoff_multiplier.powi(attempt.min(63) as i32);
        let ms = (self.retry_backoff_base_ms as f64) * exp;
        (ms.min(self.retry_backoff_max_ms as f64)) as u64
    }
}
