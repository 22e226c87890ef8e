//! In-process task backend.

use std::collections::HashMap;

use async_trait::async_trait;
use policy_engine::status::{InProgressDetail, StepProgress};
use policy_engine::{PolicyEngineRequest, RunStatus, Runner};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{validate_request, TaskBackend};
use crate::config::BackendKind;
use crate::error::AppResult;

struct TaskEntry {
    handle: Option<JoinHandle<RunStatus>>,
    progress: UnboundedReceiver<StepProgress>,
    in_progress: InProgressDetail,
    result: Option<RunStatus>,
    cancel: CancellationToken,
}

impl TaskEntry {
    /// Drain pending progress and, once the run has finished, cache its
    /// final status.
    async fn poll(&mut self, task_id: &str) -> RunStatus {
        if let Some(result) = &self.result {
            return result.clone();
        }

        while let Ok(progress) = self.progress.try_recv() {
            self.in_progress.apply(progress);
        }

        let finished = self.handle.as_ref().map_or(true, JoinHandle::is_finished);
        if finished {
            let status = match self.handle.take() {
                Some(handle) => match handle.await {
                    Ok(status) => status.with_id(task_id),
                    Err(e) => {
                        tracing::error!(task_id = %task_id, error = %e, "Run task aborted");
                        RunStatus::failed(task_id, format!("Run task aborted: {e}"), "")
                    }
                },
                None => RunStatus::failed(task_id, "Run task lost", ""),
            };
            self.result = Some(status.clone());
            return status;
        }

        if self.in_progress.status_updates.is_empty() {
            RunStatus::submitted(task_id)
        } else {
            RunStatus::InProgress(self.in_progress.clone())
        }
    }
}

/// Runs workflows as tokio tasks on the control plane's own runtime.
///
/// Tasks are tracked in a single mutex-guarded map keyed by task id; results
/// are kept for the lifetime of the process.
pub struct InProcessBackend {
    runner: Runner,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl InProcessBackend {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TaskBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn submit(&self, request: PolicyEngineRequest) -> AppResult<RunStatus> {
        validate_request(&request)?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let runner = self.runner.clone();
        let run_id = task_id.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            runner.execute(&run_id, request, run_cancel, Some(tx)).await
        });

        self.tasks.lock().await.insert(
            task_id.clone(),
            TaskEntry {
                handle: Some(handle),
                progress: rx,
                in_progress: InProgressDetail::new(task_id.clone()),
                result: None,
                cancel,
            },
        );

        tracing::info!(task_id = %task_id, "Submitted in-process run");
        Ok(RunStatus::submitted(task_id))
    }

    async fn status(&self, task_id: &str) -> AppResult<RunStatus> {
        let mut tasks = self.tasks.lock().await;
        Ok(match tasks.get_mut(task_id) {
            Some(entry) => entry.poll(task_id).await,
            None => RunStatus::unknown(task_id),
        })
    }

    async fn cancel(&self, task_id: &str) -> AppResult<RunStatus> {
        let mut tasks = self.tasks.lock().await;
        Ok(match tasks.get_mut(task_id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(task_id = %task_id, "Cancellation requested");
                entry.poll(task_id).await
            }
            None => RunStatus::unknown(task_id),
        })
    }
}
