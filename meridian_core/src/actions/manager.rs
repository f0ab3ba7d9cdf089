use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::task::JoinHandle;

use super::executor::ActionExecutor;
use super::models::{ActionRun, RunPatch};
use super::source::ActionRunSource;
use crate::config::SyncConfig;
use crate::queue::GroupQueue;
use crate::{Error, Result};

/// Polls the run source and executes claimed runs on a fixed worker pool.
///
/// Runs are routed into a group queue keyed by `{action_type}:{partition_key}`,
/// or a shared global key when the executor declines partitioning. The group
/// lock keeps a partition on a single worker at a time, which serializes
/// execution within a partition without serializing the pool.
pub struct ActionManager {
    config: SyncConfig,
    source: Arc<dyn ActionRunSource>,
    executors: DashMap<String, Arc<dyn ActionExecutor>>,
    runs: GroupQueue<ActionRun>,
    /// Run ids currently queued and unclaimed. Doubles as the backpressure
    /// counter and the redelivery dedup set; the source-side visibility
    /// timeout covers runs already claimed by a worker.
    queued_runs: DashSet<String>,
    shutting_down: Arc<AtomicBool>,
    poller: std::sync::Mutex<Option<JoinHandle<()>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

const GLOBAL_PARTITION: &str = "__global__";

impl ActionManager {
    pub fn new(config: SyncConfig, source: Arc<dyn ActionRunSource>) -> Result<Self> {
        config.validate()?;
        // The group lock mirrors the source-side visibility window: if a
        // worker dies mid-run, both release on the same clock.
        let runs = GroupQueue::new(
            Duration::from_secs(config.runs_visibility_timeout_secs),
            Duration::from_millis(config.group_sweep_interval_ms),
        );
        Ok(Self {
            config,
            source,
            executors: DashMap::new(),
            runs,
            queued_runs: DashSet::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            poller: std::sync::Mutex::new(None),
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn register_executor(&self, executor: Arc<dyn ActionExecutor>) {
        self.executors
            .insert(executor.action_type().to_string(), executor);
    }

    /// Spawn the source poller and the worker pool.
    pub fn start(self: &Arc<Self>) {
        let poller = tokio::spawn(self.clone().run_poller());
        if let Ok(mut slot) = self.poller.lock() {
            *slot = Some(poller);
        }
        let mut workers = Vec::with_capacity(self.config.action_workers);
        for worker_id in 0..self.config.action_workers {
            workers.push(tokio::spawn(self.clone().run_worker(worker_id)));
        }
        if let Ok(mut slot) = self.workers.lock() {
            *slot = workers;
        }
    }

    /// Stop polling and wait for in-flight runs, bounded by
    /// `shutdown_max_wait_ms`. Workers still running at the deadline are
    /// logged and aborted; their runs reappear once the source-side
    /// visibility timeout lapses.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let poller = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(poller) = poller {
            poller.abort();
        }

        let mut workers = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => Vec::new(),
        };
        let wait = Duration::from_millis(self.config.shutdown_max_wait_ms);
        let joined = tokio::time::timeout(
            wait,
            futures_util::future::join_all(workers.iter_mut()),
        )
        .await;
        if joined.is_err() {
            tracing::warn!(
                wait_ms = self.config.shutdown_max_wait_ms,
                "action workers still busy at shutdown deadline, aborting"
            );
            for worker in &workers {
                worker.abort();
            }
        }
    }

    async fn run_poller(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.runs_poll_interval_ms);
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            let outstanding = self.queued_runs.len();
            let capacity = self.config.runs_high_watermark.saturating_sub(outstanding);
            if capacity > 0 {
                match self
                    .source
                    .claim_pending_runs(capacity, self.config.runs_visibility_timeout_secs)
                    .await
                {
                    Ok(runs) => {
                        for run in runs {
                            self.admit(run).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to claim pending runs");
                    }
                }
            } else {
                tracing::debug!(outstanding, "run watermark reached, skipping poll");
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn admit(&self, run: ActionRun) {
        if !self.queued_runs.insert(run.id.clone()) {
            tracing::debug!(run_id = %run.id, "run already queued, ignoring redelivery");
            return;
        }
        let Some(executor) = self
            .executors
            .get(&run.action_type)
            .map(|e| e.value().clone())
        else {
            tracing::warn!(
                run_id = %run.id,
                action_type = %run.action_type,
                "no executor registered for action type, skipping run"
            );
            self.queued_runs.remove(&run.id);
            return;
        };
        let key = match executor.partition_key(&run) {
            Some(partition) => format!("{}:{partition}", run.action_type),
            None => GLOBAL_PARTITION.to_string(),
        };
        let run_id = run.id.clone();
        if let Err(err) = self.runs.put(key, run).await {
            tracing::warn!(run_id = %run_id, error = %err, "failed to queue claimed run");
            self.queued_runs.remove(&run_id);
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        loop {
            match self.runs.get_timeout(Duration::from_millis(50)).await {
                Ok(Some(claim)) => {
                    self.queued_runs.remove(&claim.item.id);
                    self.execute_run(&claim.item).await;
                    if let Err(err) = self.runs.commit(claim).await {
                        tracing::warn!(worker_id, error = %err, "failed to commit run claim");
                    }
                }
                Ok(None) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        tracing::debug!(worker_id, "action worker stopping");
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    async fn execute_run(&self, run: &ActionRun) {
        let Some(executor) = self
            .executors
            .get(&run.action_type)
            .map(|e| e.value().clone())
        else {
            tracing::warn!(run_id = %run.id, "executor disappeared before execution");
            return;
        };

        let cap = Duration::from_secs(self.config.rate_limit_backoff_cap_secs);
        let mut progress_logged = false;
        while let Some(state) = executor.is_close_to_rate_limit().await {
            if self.shutting_down.load(Ordering::SeqCst) {
                tracing::debug!(run_id = %run.id, "shutdown requested during rate limit wait, releasing run");
                return;
            }
            let wait = state.remaining.min(cap);
            if !progress_logged {
                progress_logged = true;
                let message = format!(
                    "waiting for the {} rate limit to clear before executing",
                    run.action_type
                );
                if let Err(err) = self.source.post_run_log(&run.id, &message).await {
                    tracing::warn!(run_id = %run.id, error = %err, "failed to post rate limit progress log");
                }
            }
            tracing::info!(
                run_id = %run.id,
                action_type = %run.action_type,
                wait_ms = wait.as_millis() as u64,
                "waiting out executor rate limit before run"
            );
            tokio::time::sleep(wait).await;
        }

        match self.source.acknowledge_run(&run.id).await {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {
                tracing::debug!(run_id = %run.id, "run acknowledged by another worker, dropping");
                return;
            }
            Err(err) => {
                tracing::warn!(run_id = %run.id, error = %err, "failed to acknowledge run");
                let patch = RunPatch::failure(format!("could not acknowledge run: {err}"));
                if let Err(patch_err) = self.source.patch_run(&run.id, &patch).await {
                    tracing::warn!(run_id = %run.id, error = %patch_err, "failed to report acknowledge failure");
                }
                return;
            }
        }

        match executor.execute(run).await {
            Ok(summary) => {
                tracing::info!(run_id = %run.id, action_type = %run.action_type, "action run succeeded");
                if let Err(err) = self
                    .source
                    .patch_run(&run.id, &RunPatch::success(summary))
                    .await
                {
                    tracing::warn!(run_id = %run.id, error = %err, "failed to report run success");
                }
            }
            Err(err) => {
                tracing::warn!(run_id = %run.id, action_type = %run.action_type, error = %err, "action run failed");
                let _ = self
                    .source
                    .post_run_log(&run.id, &format!("run failed: {err}"))
                    .await;
                if let Err(patch_err) = self
                    .source
                    .patch_run(&run.id, &RunPatch::failure(err.to_string()))
                    .await
                {
                    tracing::warn!(run_id = %run.id, error = %patch_err, "failed to report run failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::executor::RateLimitState;
    use crate::actions::models::RunStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Instant;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            runs_poll_interval_ms: 20,
            shutdown_max_wait_ms: 2_000,
            action_workers: 3,
            ..Default::default()
        }
    }

    fn run(id: &str, action_type: &str) -> ActionRun {
        ActionRun {
            id: id.to_string(),
            action_type: action_type.to_string(),
            properties: json!({}),
            status: RunStatus::InProgress,
        }
    }

    #[derive(Default)]
    struct FakeSource {
        pending: Mutex<VecDeque<ActionRun>>,
        /// Redeliver claimed runs until they are acknowledged.
        redeliver: bool,
        /// Deliver at most this many runs per poll regardless of the limit.
        claim_cap: Option<usize>,
        ack_conflict: bool,
        ack_error: bool,
        acked: Mutex<Vec<String>>,
        patches: Mutex<Vec<(String, Option<RunStatus>)>>,
        logs: Mutex<Vec<String>>,
        max_claim_limit: AtomicUsize,
    }

    impl FakeSource {
        fn with_pending(runs: Vec<ActionRun>, redeliver: bool) -> Self {
            Self {
                pending: Mutex::new(runs.into()),
                redeliver,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ActionRunSource for FakeSource {
        async fn claim_pending_runs(
            &self,
            limit: usize,
            _visibility_timeout_secs: u64,
        ) -> Result<Vec<ActionRun>> {
            self.max_claim_limit.fetch_max(limit, Ordering::SeqCst);
            let limit = self.claim_cap.map_or(limit, |cap| limit.min(cap));
            let mut pending = self.pending.lock().unwrap();
            if self.redeliver {
                // Acknowledged runs are invisible until the visibility
                // timeout lapses; nothing in these tests waits that long.
                let acked = self.acked.lock().unwrap();
                Ok(pending
                    .iter()
                    .filter(|r| !acked.contains(&r.id))
                    .take(limit)
                    .cloned()
                    .collect())
            } else {
                let take = limit.min(pending.len());
                Ok(pending.drain(..take).collect())
            }
        }

        async fn acknowledge_run(&self, run_id: &str) -> Result<()> {
            if self.ack_conflict {
                return Err(Error::Conflict("already acknowledged".to_string()));
            }
            if self.ack_error {
                return Err(Error::message("source unavailable during acknowledge"));
            }
            self.acked.lock().unwrap().push(run_id.to_string());
            Ok(())
        }

        async fn patch_run(&self, run_id: &str, patch: &RunPatch) -> Result<()> {
            self.patches
                .lock()
                .unwrap()
                .push((run_id.to_string(), patch.status));
            self.pending.lock().unwrap().retain(|r| r.id != run_id);
            Ok(())
        }

        async fn post_run_log(&self, _run_id: &str, message: &str) -> Result<()> {
            self.logs.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct RecordingExecutor {
        action: &'static str,
        delay: Duration,
        fail: bool,
        executions: Mutex<Vec<String>>,
        rate_checks: AtomicU32,
        rate_limited_once: AtomicBool,
        always_limited: bool,
        partitioned: bool,
        active: AtomicU32,
        max_active: AtomicU32,
    }

    impl RecordingExecutor {
        fn new(action: &'static str) -> Self {
            Self {
                action,
                delay: Duration::ZERO,
                fail: false,
                executions: Mutex::new(Vec::new()),
                rate_checks: AtomicU32::new(0),
                rate_limited_once: AtomicBool::new(false),
                always_limited: false,
                partitioned: false,
                active: AtomicU32::new(0),
                max_active: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        fn action_type(&self) -> &str {
            self.action
        }

        fn partition_key(&self, run: &ActionRun) -> Option<String> {
            if self.partitioned {
                run.properties["partition"].as_str().map(str::to_string)
            } else {
                None
            }
        }

        async fn is_close_to_rate_limit(&self) -> Option<RateLimitState> {
            self.rate_checks.fetch_add(1, Ordering::SeqCst);
            if self.always_limited {
                return Some(RateLimitState {
                    remaining: Duration::from_millis(50),
                });
            }
            if self.rate_limited_once.swap(false, Ordering::SeqCst) {
                Some(RateLimitState {
                    remaining: Duration::from_millis(150),
                })
            } else {
                None
            }
        }

        async fn execute(&self, run: &ActionRun) -> Result<String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.executions.lock().unwrap().push(run.id.clone());
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::message("downstream rejected the request"))
            } else {
                Ok(format!("completed {}", run.id))
            }
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn redelivered_run_executes_exactly_once() {
        init_tracing();
        let source = Arc::new(FakeSource::with_pending(vec![run("r1", "deploy")], true));
        let executor = Arc::new(RecordingExecutor {
            delay: Duration::from_millis(150),
            ..RecordingExecutor::new("deploy")
        });
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(executor.clone());
        manager.start();

        // Several poll cycles happen while the first execution is sleeping.
        wait_until(|| !source.patches.lock().unwrap().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.executions.lock().unwrap().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_claim_while_queued_is_a_no_op() {
        let source = Arc::new(FakeSource::default());
        let manager = Arc::new(ActionManager::new(fast_config(), source).unwrap());
        manager.register_executor(Arc::new(RecordingExecutor::new("deploy")));

        manager.admit(run("r1", "deploy")).await;
        manager.admit(run("r1", "deploy")).await;

        assert_eq!(manager.queued_runs.len(), 1);
        assert_eq!(manager.runs.size().await, 1);
    }

    #[tokio::test]
    async fn a_partition_never_occupies_more_than_one_worker() {
        init_tracing();
        let runs: Vec<ActionRun> = (0..3)
            .map(|i| {
                let mut r = run(&format!("a{i}"), "deploy");
                r.properties = json!({"partition": "a"});
                r
            })
            .collect();
        // One run per poll so later runs arrive while an earlier one is
        // still executing.
        let source = Arc::new(FakeSource {
            claim_cap: Some(1),
            ..FakeSource::with_pending(runs, false)
        });
        let executor = Arc::new(RecordingExecutor {
            partitioned: true,
            delay: Duration::from_millis(200),
            ..RecordingExecutor::new("deploy")
        });
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(executor.clone());
        manager.start();

        wait_until(|| executor.executions.lock().unwrap().len() == 3).await;
        assert_eq!(executor.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(*executor.executions.lock().unwrap(), ["a0", "a1", "a2"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn claims_never_exceed_remaining_watermark() {
        init_tracing();
        let runs: Vec<ActionRun> = (0..10).map(|i| run(&format!("r{i}"), "deploy")).collect();
        let source = Arc::new(FakeSource::with_pending(runs, false));
        let executor = Arc::new(RecordingExecutor {
            delay: Duration::from_millis(20),
            ..RecordingExecutor::new("deploy")
        });
        let config = SyncConfig {
            runs_high_watermark: 2,
            ..fast_config()
        };
        let manager = Arc::new(ActionManager::new(config, source.clone()).unwrap());
        manager.register_executor(executor.clone());
        manager.start();

        wait_until(|| executor.executions.lock().unwrap().len() == 10).await;
        assert!(source.max_claim_limit.load(Ordering::SeqCst) <= 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn rate_limited_executor_delays_the_run() {
        let source = Arc::new(FakeSource::with_pending(vec![run("r1", "deploy")], false));
        let executor = Arc::new(RecordingExecutor {
            rate_limited_once: AtomicBool::new(true),
            ..RecordingExecutor::new("deploy")
        });
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(executor.clone());
        let started = Instant::now();
        manager.start();

        wait_until(|| executor.executions.lock().unwrap().len() == 1).await;
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(executor.rate_checks.load(Ordering::SeqCst) >= 2);
        // Exactly one progress log for the whole wait.
        let logs = source.logs.lock().unwrap().clone();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("rate limit"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_rate_limit_wait() {
        init_tracing();
        let source = Arc::new(FakeSource::with_pending(vec![run("r1", "deploy")], false));
        let executor = Arc::new(RecordingExecutor {
            always_limited: true,
            ..RecordingExecutor::new("deploy")
        });
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(executor.clone());
        manager.start();

        wait_until(|| executor.rate_checks.load(Ordering::SeqCst) >= 1).await;
        let started = Instant::now();
        manager.shutdown().await;

        // The worker gives the run up instead of waiting out the limiter.
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert!(source.acked.lock().unwrap().is_empty());
        assert!(executor.executions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_error_reports_a_terminal_failure() {
        let source = Arc::new(FakeSource {
            ack_error: true,
            ..FakeSource::with_pending(vec![run("r1", "deploy")], false)
        });
        let executor = Arc::new(RecordingExecutor::new("deploy"));
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(executor.clone());
        manager.start();

        wait_until(|| !source.patches.lock().unwrap().is_empty()).await;
        let patches = source.patches.lock().unwrap().clone();
        assert_eq!(patches[0], ("r1".to_string(), Some(RunStatus::Failure)));
        assert!(executor.executions.lock().unwrap().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn acknowledge_conflict_drops_the_run_silently() {
        let source = Arc::new(FakeSource {
            ack_conflict: true,
            ..FakeSource::with_pending(vec![run("r1", "deploy")], false)
        });
        let executor = Arc::new(RecordingExecutor::new("deploy"));
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(executor.clone());
        manager.start();

        wait_until(|| manager.queued_runs.is_empty() && source.pending.lock().unwrap().is_empty())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executor.executions.lock().unwrap().is_empty());
        assert!(source.patches.lock().unwrap().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_run_reports_failure_and_log() {
        let source = Arc::new(FakeSource::with_pending(vec![run("r1", "deploy")], false));
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            ..RecordingExecutor::new("deploy")
        });
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(executor.clone());
        manager.start();

        wait_until(|| !source.patches.lock().unwrap().is_empty()).await;
        let patches = source.patches.lock().unwrap();
        assert_eq!(patches[0], ("r1".to_string(), Some(RunStatus::Failure)));
        assert_eq!(source.logs.lock().unwrap().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_action_type_is_skipped() {
        let source = Arc::new(FakeSource::with_pending(vec![run("r1", "mystery")], false));
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(Arc::new(RecordingExecutor::new("deploy")));
        manager.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(source.acked.lock().unwrap().is_empty());
        assert!(manager.queued_runs.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn partitioned_runs_keep_claim_order_within_a_partition() {
        let mut runs = Vec::new();
        for i in 0..4 {
            let mut r = run(&format!("a{i}"), "deploy");
            r.properties = json!({"partition": "a"});
            runs.push(r);
            let mut r = run(&format!("b{i}"), "deploy");
            r.properties = json!({"partition": "b"});
            runs.push(r);
        }
        let source = Arc::new(FakeSource::with_pending(runs, false));
        let executor = Arc::new(RecordingExecutor {
            partitioned: true,
            delay: Duration::from_millis(5),
            ..RecordingExecutor::new("deploy")
        });
        let manager = Arc::new(ActionManager::new(fast_config(), source.clone()).unwrap());
        manager.register_executor(executor.clone());
        manager.start();

        wait_until(|| executor.executions.lock().unwrap().len() == 8).await;
        let order = executor.executions.lock().unwrap().clone();
        let a_order: Vec<&String> = order.iter().filter(|id| id.starts_with('a')).collect();
        let b_order: Vec<&String> = order.iter().filter(|id| id.starts_with('b')).collect();
        assert_eq!(a_order, ["a0", "a1", "a2", "a3"]);
        assert_eq!(b_order, ["b0", "b1", "b2", "b3"]);
        manager.shutdown().await;
    }
}
