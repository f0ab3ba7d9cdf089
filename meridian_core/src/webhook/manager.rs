use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::models::{LifecycleInstant, WebhookEvent};
use super::processor::WebhookProcessor;
use crate::config::SyncConfig;
use crate::queue::{MemoryQueue, Queue};
use crate::{Error, Result};

type SharedProcessors = Arc<std::sync::Mutex<Vec<Arc<dyn WebhookProcessor>>>>;

struct PathEntry {
    processors: SharedProcessors,
    queue: MemoryQueue<WebhookEvent>,
    worker: JoinHandle<()>,
}

/// Owns one ordered in-memory queue and one consuming worker per webhook
/// path. Events on the same path are processed strictly in arrival order;
/// distinct paths proceed independently.
pub struct ProcessorManager {
    config: SyncConfig,
    paths: DashMap<String, PathEntry>,
    shutting_down: Arc<AtomicBool>,
}

impl ProcessorManager {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            paths: DashMap::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register a processor for a path. The path's queue and worker are
    /// created lazily on the first registration.
    pub fn register(&self, path: &str, processor: Arc<dyn WebhookProcessor>) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::QueueClosed);
        }
        let entry = self.paths.entry(path.to_string()).or_insert_with(|| {
            let queue = MemoryQueue::new();
            let processors: SharedProcessors = Arc::new(std::sync::Mutex::new(Vec::new()));
            let worker = tokio::spawn(Self::run_worker(
                path.to_string(),
                queue.clone(),
                processors.clone(),
                self.config.clone(),
                self.shutting_down.clone(),
            ));
            PathEntry {
                processors,
                queue,
                worker,
            }
        });
        entry
            .processors
            .lock()
            .map_err(|_| Error::message("processor registry lock poisoned"))?
            .push(processor);
        Ok(())
    }

    pub fn registered_paths(&self) -> Vec<String> {
        self.paths.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    /// Hand a received event to the path's queue. Returns immediately; the
    /// path worker processes it later.
    pub async fn enqueue(&self, path: &str, mut event: WebhookEvent) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::QueueClosed);
        }
        let queue = {
            let entry = self
                .paths
                .get(path)
                .ok_or_else(|| Error::NotFound(format!("no processors registered for {path}")))?;
            entry.queue.clone()
        };
        event.record(LifecycleInstant::AddedToQueue);
        tracing::debug!(path, trace_id = %event.trace_id, "webhook event queued");
        queue.put(event).await
    }

    /// Stop accepting events, cancel processors, and wait for path queues to
    /// drain, bounded by `shutdown_max_wait_ms`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let mut processors: Vec<Arc<dyn WebhookProcessor>> = Vec::new();
        let mut queues: Vec<MemoryQueue<WebhookEvent>> = Vec::new();
        for entry in self.paths.iter() {
            if let Ok(list) = entry.processors.lock() {
                processors.extend(list.iter().cloned());
            }
            queues.push(entry.queue.clone());
        }
        for processor in &processors {
            processor.cancel().await;
        }

        let drain = async {
            for queue in &queues {
                let _ = queue.teardown().await;
            }
        };
        let wait = Duration::from_millis(self.config.shutdown_max_wait_ms);
        if tokio::time::timeout(wait, drain).await.is_err() {
            tracing::warn!(
                wait_ms = self.config.shutdown_max_wait_ms,
                "webhook queues did not drain before shutdown deadline"
            );
        }

        for entry in self.paths.iter() {
            entry.worker.abort();
        }
    }

    async fn run_worker(
        path: String,
        queue: MemoryQueue<WebhookEvent>,
        processors: SharedProcessors,
        config: SyncConfig,
        shutting_down: Arc<AtomicBool>,
    ) {
        loop {
            match queue.get_timeout(Duration::from_millis(50)).await {
                Ok(Some(event)) => {
                    Self::dispatch(&path, event, &processors, &config, &shutting_down).await;
                    // Commit unconditionally so a poison event can never
                    // wedge the path.
                    let _ = queue.commit().await;
                }
                Ok(None) => {
                    if shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    async fn dispatch(
        path: &str,
        mut event: WebhookEvent,
        processors: &SharedProcessors,
        config: &SyncConfig,
        shutting_down: &Arc<AtomicBool>,
    ) {
        event.record(LifecycleInstant::StartedProcessing);
        let snapshot: Vec<Arc<dyn WebhookProcessor>> = match processors.lock() {
            Ok(list) => list.clone(),
            Err(_) => return,
        };

        // First matching predicate wins, in registration order.
        let mut chosen = None;
        for processor in snapshot {
            if processor.should_process(&event).await {
                chosen = Some(processor);
                break;
            }
        }
        let Some(processor) = chosen else {
            tracing::debug!(path, trace_id = %event.trace_id, "no processor matched the event");
            event.record(LifecycleInstant::FinishedProcessingSuccessfully);
            return;
        };

        let budget = Duration::from_millis(config.webhook_timeout_ms);
        let attempt_loop = Self::process_with_retries(&processor, &mut event, config, shutting_down);
        let outcome = match tokio::time::timeout(budget, attempt_loop).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(config.webhook_timeout_ms)),
        };
        let mut failed = false;
        if let Err(err) = outcome {
            failed = true;
            tracing::warn!(
                path,
                trace_id = %event.trace_id,
                processor = processor.name(),
                error = %err,
                "webhook event processing failed"
            );
        }

        event.record(if failed {
            LifecycleInstant::FinishedProcessingWithError
        } else {
            LifecycleInstant::FinishedProcessingSuccessfully
        });
        tracing::debug!(path, trace_id = %event.trace_id, failed, "webhook event finished");
    }

    async fn process_with_retries(
        processor: &Arc<dyn WebhookProcessor>,
        event: &mut WebhookEvent,
        config: &SyncConfig,
        shutting_down: &Arc<AtomicBool>,
    ) -> Result<()> {
        if !processor.authenticate(event).await {
            return Err(Error::InvalidInput(
                "webhook delivery failed authentication".to_string(),
            ));
        }
        if !processor.validate_payload(event).await {
            return Err(Error::InvalidInput(
                "webhook payload failed validation".to_string(),
            ));
        }

        let mut attempt: u32 = 0;
        loop {
            match processor.handle_event(event).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let retryable = processor.should_retry(&err)
                        && attempt < config.max_retries
                        && !shutting_down.load(Ordering::SeqCst);
                    if !retryable {
                        return Err(err);
                    }
                    processor.on_error(event, &err).await;
                    event.retry_count += 1;
                    let backoff = config.retry_backoff_ms(attempt);
                    tracing::debug!(
                        trace_id = %event.trace_id,
                        attempt,
                        backoff_ms = backoff,
                        "retrying webhook event"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Drop for ProcessorManager {
    fn drop(&mut self) {
        for entry in self.paths.iter() {
            entry.worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            retry_backoff_base_ms: 1,
            retry_backoff_max_ms: 5,
            webhook_timeout_ms: 500,
            shutdown_max_wait_ms: 2_000,
            ..Default::default()
        }
    }

    struct FlakyProcessor {
        failures_left: AtomicU32,
        retryable: bool,
        succeeded_with_retry_count: Mutex<Option<u32>>,
        error_hook_calls: AtomicU32,
    }

    impl FlakyProcessor {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                retryable,
                succeeded_with_retry_count: Mutex::new(None),
                error_hook_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl WebhookProcessor for FlakyProcessor {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn should_process(&self, _event: &WebhookEvent) -> bool {
            true
        }

        async fn authenticate(&self, _event: &WebhookEvent) -> bool {
            true
        }

        async fn validate_payload(&self, _event: &WebhookEvent) -> bool {
            true
        }

        async fn handle_event(&self, event: &WebhookEvent) -> Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::message("flaky failure"));
            }
            *self.succeeded_with_retry_count.lock().unwrap() = Some(event.retry_count);
            Ok(())
        }

        fn should_retry(&self, _error: &Error) -> bool {
            self.retryable
        }

        async fn on_error(&self, _event: &WebhookEvent, _error: &Error) {
            self.error_hook_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn retryable_failures_increment_retry_count() {
        init_tracing();
        let manager = ProcessorManager::new(fast_config()).unwrap();
        let processor = Arc::new(FlakyProcessor::new(2, true));
        manager.register("/hook", processor.clone()).unwrap();

        let event = WebhookEvent::new(json!({"n": 1}), HashMap::new());
        manager.enqueue("/hook", event).await.unwrap();

        wait_until(|| processor.succeeded_with_retry_count.lock().unwrap().is_some()).await;
        assert_eq!(
            *processor.succeeded_with_retry_count.lock().unwrap(),
            Some(2)
        );
        assert_eq!(processor.error_hook_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_gives_up_immediately() {
        let manager = ProcessorManager::new(fast_config()).unwrap();
        let processor = Arc::new(FlakyProcessor::new(1, false));
        manager.register("/hook", processor.clone()).unwrap();

        manager
            .enqueue("/hook", WebhookEvent::new(json!({}), HashMap::new()))
            .await
            .unwrap();
        // A follow-up event proves the worker moved on after the failure.
        manager
            .enqueue("/hook", WebhookEvent::new(json!({}), HashMap::new()))
            .await
            .unwrap();

        wait_until(|| processor.succeeded_with_retry_count.lock().unwrap().is_some()).await;
        assert_eq!(
            *processor.succeeded_with_retry_count.lock().unwrap(),
            Some(0)
        );
        assert_eq!(processor.error_hook_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_handler_hits_the_event_budget() {
        struct SlowProcessor {
            timed_out_runs: AtomicU32,
        }

        #[async_trait::async_trait]
        impl WebhookProcessor for SlowProcessor {
            fn name(&self) -> &str {
                "slow"
            }
            async fn should_process(&self, _event: &WebhookEvent) -> bool {
                true
            }
            async fn authenticate(&self, _event: &WebhookEvent) -> bool {
                true
            }
            async fn validate_payload(&self, _event: &WebhookEvent) -> bool {
                true
            }
            async fn handle_event(&self, _event: &WebhookEvent) -> Result<()> {
                self.timed_out_runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let config = SyncConfig {
            webhook_timeout_ms: 50,
            ..fast_config()
        };
        let manager = ProcessorManager::new(config).unwrap();
        let processor = Arc::new(SlowProcessor {
            timed_out_runs: AtomicU32::new(0),
        });
        manager.register("/slow", processor.clone()).unwrap();

        manager
            .enqueue("/slow", WebhookEvent::new(json!({}), HashMap::new()))
            .await
            .unwrap();
        manager
            .enqueue("/slow", WebhookEvent::new(json!({}), HashMap::new()))
            .await
            .unwrap();

        // Both events complete (as failures) despite the 60s handler sleep.
        wait_until(|| processor.timed_out_runs.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn enqueue_to_unknown_path_is_not_found() {
        let manager = ProcessorManager::new(fast_config()).unwrap();
        let err = manager
            .enqueue("/nowhere", WebhookEvent::new(json!({}), HashMap::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn processors_are_filtered_by_predicate() {
        struct PickyProcessor {
            wanted_action: &'static str,
            seen: AtomicU32,
        }

        #[async_trait::async_trait]
        impl WebhookProcessor for PickyProcessor {
            fn name(&self) -> &str {
                "picky"
            }
            async fn should_process(&self, event: &WebhookEvent) -> bool {
                event.payload["action"] == self.wanted_action
            }
            async fn authenticate(&self, _event: &WebhookEvent) -> bool {
                true
            }
            async fn validate_payload(&self, _event: &WebhookEvent) -> bool {
                true
            }
            async fn handle_event(&self, _event: &WebhookEvent) -> Result<()> {
                self.seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let manager = ProcessorManager::new(fast_config()).unwrap();
        let opened = Arc::new(PickyProcessor {
            wanted_action: "opened",
            seen: AtomicU32::new(0),
        });
        let closed = Arc::new(PickyProcessor {
            wanted_action: "closed",
            seen: AtomicU32::new(0),
        });
        let opened_too = Arc::new(PickyProcessor {
            wanted_action: "opened",
            seen: AtomicU32::new(0),
        });
        manager.register("/hook", opened.clone()).unwrap();
        manager.register("/hook", closed.clone()).unwrap();
        manager.register("/hook", opened_too.clone()).unwrap();

        manager
            .enqueue(
                "/hook",
                WebhookEvent::new(json!({"action": "opened"}), HashMap::new()),
            )
            .await
            .unwrap();

        wait_until(|| opened.seen.load(Ordering::SeqCst) == 1).await;
        // First matching registration wins; later matches never run.
        assert_eq!(closed.seen.load(Ordering::SeqCst), 0);
        assert_eq!(opened_too.seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_events() {
        init_tracing();
        let manager = ProcessorManager::new(fast_config()).unwrap();
        let processor = Arc::new(FlakyProcessor::new(0, false));
        manager.register("/hook", processor.clone()).unwrap();

        for _ in 0..5 {
            manager
                .enqueue("/hook", WebhookEvent::new(json!({}), HashMap::new()))
                .await
                .unwrap();
        }
        manager.shutdown().await;

        assert!(processor.succeeded_with_retry_count.lock().unwrap().is_some());
        let err = manager
            .enqueue("/hook", WebhookEvent::new(json!({}), HashMap::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
    }
}
