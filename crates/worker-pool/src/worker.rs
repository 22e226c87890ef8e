//! Worker lifecycle management.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::StreamExt;
use policy_engine::status::InProgressDetail;
use policy_engine::task::{CancelMessage, TaskMessage};
use policy_engine::{RunStatus, Runner};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::nats::{NatsSubscriber, ResultStore, StatusSink};

/// Cancellation tokens of the runs this worker is executing.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(task_id.to_string(), token.clone());
        }
        token
    }

    pub fn remove(&self, task_id: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(task_id);
        }
    }

    /// Cancel a run if this worker owns it. Returns whether it did.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.lock() {
            Ok(tokens) => match tokens.get(task_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|tokens| tokens.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Execute one task, keeping its status in `sink` current: `in_progress`
/// while running (with per-step updates), then the final status.
///
/// A task whose stored status is already terminal was cancelled while queued
/// and is not run.
pub async fn execute_task(
    runner: &Runner,
    sink: Arc<dyn StatusSink>,
    registry: &CancelRegistry,
    task: TaskMessage,
) -> RunStatus {
    let task_id = task.task_id.clone();
    // Registered before the check so a cancellation racing it is still seen.
    let cancel = registry.register(&task_id);

    match sink.get(&task_id).await {
        Ok(Some(stored)) if stored.is_terminal() => {
            registry.remove(&task_id);
            tracing::info!(task_id = %task_id, status = stored.kind(), "Skipping run cancelled while queued");
            return stored;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Failed to read stored status"),
    }

    let queued_ms = (chrono::Utc::now() - task.submitted_at).num_milliseconds();
    tracing::info!(task_id = %task_id, queued_ms, "Starting run");

    let mut detail = InProgressDetail::new(task_id.clone());
    if let Err(e) = sink.put(&task_id, &RunStatus::InProgress(detail.clone())).await {
        tracing::warn!(task_id = %task_id, error = %e, "Failed to store in-progress status");
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let forward_sink = sink.clone();
    let forward_id = task_id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            detail.apply(progress);
            if let Err(e) = forward_sink
                .put(&forward_id, &RunStatus::InProgress(detail.clone()))
                .await
            {
                tracing::warn!(task_id = %forward_id, error = %e, "Failed to store progress");
            }
        }
    });

    let status = runner.execute(&task_id, task.request, cancel, Some(tx)).await;

    // The runner has dropped its sender; wait for the last progress write so
    // it cannot overwrite the final status.
    if let Err(e) = forwarder.await {
        tracing::warn!(task_id = %task_id, error = %e, "Progress forwarder failed");
    }

    if let Err(e) = sink.put(&task_id, &status).await {
        tracing::error!(task_id = %task_id, error = %e, "Failed to store final status");
    }
    registry.remove(&task_id);

    tracing::info!(task_id = %task_id, status = status.kind(), "Run finished");
    status
}

/// Worker that executes runs dispatched by the control plane.
pub struct Worker {
    /// Worker configuration.
    config: WorkerConfig,

    /// NATS client, used for the cancellation subscription.
    client: async_nats::Client,

    /// Task message subscriber.
    subscriber: NatsSubscriber,

    /// Result bucket.
    results: Arc<ResultStore>,

    runner: Runner,

    registry: CancelRegistry,

    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
}

impl Worker {
    /// Connect to NATS and prepare the stream, consumer and result bucket.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        let client = async_nats::connect(config.nats_url.as_str()).await?;
        let js = async_nats::jetstream::new(client.clone());

        let subscriber = NatsSubscriber::connect(
            &js,
            &config.nats_stream,
            &config.nats_subject,
            &config.nats_consumer,
        )
        .await?;
        let results = Arc::new(ResultStore::open(&js, &config.result_bucket).await?);

        let runner = Runner::new(config.engine.clone());
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));

        Ok(Self {
            config,
            client,
            subscriber,
            results,
            runner,
            registry: CancelRegistry::default(),
            semaphore,
        })
    }

    /// Run the worker until an unrecoverable error.
    pub async fn run(&self) -> Result<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        tracing::info!(
            worker_id = %self.config.worker_id,
            pool_name = %self.config.pool_name,
            hostname = %hostname,
            max_concurrent = self.config.max_concurrent_tasks,
            "Worker started"
        );

        let cancel_handle = self.start_cancel_listener().await?;
        let result = self.process_tasks().await;
        cancel_handle.abort();

        result
    }

    /// Listen for cancellation requests on the core cancel subject.
    async fn start_cancel_listener(&self) -> Result<tokio::task::JoinHandle<()>> {
        let mut subscription = self
            .client
            .subscribe(self.config.nats_cancel_subject.clone())
            .await?;
        let registry = self.registry.clone();
        let worker_id = self.config.worker_id.clone();

        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                match serde_json::from_slice::<CancelMessage>(&message.payload) {
                    Ok(cancel) => {
                        if registry.cancel(&cancel.task_id) {
                            tracing::info!(
                                task_id = %cancel.task_id,
                                worker_id = %worker_id,
                                "Cancelled run"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed cancel message"),
                }
            }
        }))
    }

    /// Pull tasks and execute them, at most `max_concurrent_tasks` at once.
    async fn process_tasks(&self) -> Result<()> {
        loop {
            // Wait for available slot
            let permit = self.semaphore.clone().acquire_owned().await?;

            match self.subscriber.receive().await? {
                Some(task) => {
                    tracing::debug!(task_id = %task.task_id, "Received task");

                    let runner = self.runner.clone();
                    let sink: Arc<dyn StatusSink> = self.results.clone();
                    let registry = self.registry.clone();

                    tokio::spawn(async move {
                        // Keep permit until done
                        let _permit = permit;
                        execute_task(&runner, sink, &registry, task).await;
                    });
                }
                None => {
                    // No message, release permit and continue
                    drop(permit);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use policy_engine::status::ExitStatus;
    use policy_engine::{EngineConfig, PolicyEngineRequest, Workflow};
    use std::time::Duration;

    #[derive(Default)]
    struct MemorySink {
        writes: Mutex<Vec<RunStatus>>,
    }

    #[async_trait]
    impl StatusSink for MemorySink {
        async fn put(&self, _task_id: &str, status: &RunStatus) -> Result<()> {
            self.writes.lock().unwrap().push(status.clone());
            Ok(())
        }

        async fn get(&self, _task_id: &str) -> Result<Option<RunStatus>> {
            Ok(self.writes.lock().unwrap().last().cloned())
        }
    }

    fn task(yaml: &str) -> TaskMessage {
        TaskMessage::new(PolicyEngineRequest::new(Workflow::from_yaml_str(yaml).unwrap()))
    }

    #[test]
    fn test_registry_cancels_only_owned_runs() {
        let registry = CancelRegistry::default();
        let token = registry.register("t1");

        assert!(!registry.cancel("t2"));
        assert!(registry.cancel("t1"));
        assert!(token.is_cancelled());

        registry.remove("t1");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute_task_writes_progress_then_final_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(EngineConfig::default().with_temp_dir(dir.path()));
        let sink = Arc::new(MemorySink::default());
        let registry = CancelRegistry::default();

        let status = execute_task(
            &runner,
            sink.clone(),
            &registry,
            task("jobs:\n  j:\n    steps:\n      - id: a\n        run: echo ok\n"),
        )
        .await;

        match &status {
            RunStatus::Complete(detail) => assert_eq!(detail.exit_status, ExitStatus::Success),
            other => panic!("unexpected status {other:?}"),
        }

        let writes = sink.writes.lock().unwrap().clone();
        assert_eq!(writes.first().map(RunStatus::kind), Some("in_progress"));
        assert_eq!(writes.last(), Some(&status));
        assert!(writes[..writes.len() - 1].iter().all(|w| w.kind() == "in_progress"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute_task_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(EngineConfig::default().with_temp_dir(dir.path()));
        let sink = Arc::new(MemorySink::default());
        let registry = CancelRegistry::default();

        let message = task("jobs:\n  j:\n    steps:\n      - run: sleep 30\n");
        let task_id = message.task_id.clone();

        let canceller = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    if registry.cancel(&task_id) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
        };

        let status = tokio::time::timeout(
            Duration::from_secs(20),
            execute_task(&runner, sink, &registry, message),
        )
        .await
        .unwrap();
        canceller.await.unwrap();

        match status {
            RunStatus::Complete(detail) => assert_eq!(detail.exit_status, ExitStatus::Failure),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_task_skips_run_cancelled_while_queued() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(EngineConfig::default().with_temp_dir(dir.path()));
        let sink = Arc::new(MemorySink::default());
        let registry = CancelRegistry::default();

        let message = task("jobs:\n  j:\n    steps:\n      - run: echo should-not-run\n");
        let marker = RunStatus::cancelled(&message.task_id);
        sink.put(&message.task_id, &marker).await.unwrap();

        let status = execute_task(&runner, sink.clone(), &registry, message).await;

        assert_eq!(status, marker);
        assert_eq!(sink.writes.lock().unwrap().len(), 1);
        assert!(registry.is_empty());
    }
}
