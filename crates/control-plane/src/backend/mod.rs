//! Task backends.
//!
//! A [`TaskBackend`] accepts a [`PolicyEngineRequest`], returns a task id
//! immediately and answers status polls for that id. The in-process backend
//! runs the workflow on this server's runtime; the NATS backend hands it to
//! the worker pool over JetStream and reads results from a key-value bucket.
//! Both are selected once at startup by [`crate::config::BackendKind`].

mod in_process;
mod nats;

use async_trait::async_trait;
use policy_engine::{EngineError, PolicyEngineRequest, RunStatus};

use crate::config::BackendKind;
use crate::error::{AppError, AppResult};

pub use self::in_process::InProcessBackend;
pub use self::nats::NatsBackend;

/// Submit / poll / cancel interface shared by every backend.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Enqueue a run. Returns `submitted` with the new task id.
    async fn submit(&self, request: PolicyEngineRequest) -> AppResult<RunStatus>;

    /// Current status of a task; `unknown` when the id was never recorded.
    async fn status(&self, task_id: &str) -> AppResult<RunStatus>;

    /// Request cancellation and return the status as of the request.
    async fn cancel(&self, task_id: &str) -> AppResult<RunStatus>;
}

/// Reject requests whose workflow would fail validation before anything is
/// queued. Issue locations are reported relative to the request body.
pub(crate) fn validate_request(request: &PolicyEngineRequest) -> AppResult<()> {
    match request.workflow.validate() {
        Ok(()) => Ok(()),
        Err(EngineError::Validation(issues)) => Err(AppError::Validation(
            issues
                .into_iter()
                .map(|mut issue| {
                    issue.loc.insert(0, "body".to_string());
                    issue
                })
                .collect(),
        )),
        Err(e) => Err(e.into()),
    }
}
