//! Messages exchanged between the control plane and workers over the
//! distributed task backend.

use serde::{Deserialize, Serialize};

use crate::request::PolicyEngineRequest;

/// Default JetStream subject for task dispatch.
pub const DEFAULT_TASK_SUBJECT: &str = "policy_engine.tasks";

/// Default JetStream stream holding task messages.
pub const DEFAULT_TASK_STREAM: &str = "policy_engine_tasks";

/// Default core NATS subject for task revocation.
pub const DEFAULT_CANCEL_SUBJECT: &str = "policy_engine.cancel";

/// Default key-value bucket storing run status by task id.
pub const DEFAULT_RESULT_BUCKET: &str = "policy_engine_results";

/// A unit of work placed on the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Opaque task id; also the result store key.
    pub task_id: String,

    /// Full request to execute.
    pub request: PolicyEngineRequest,

    /// Submission time.
    pub submitted_at: chrono::DateTime<chrono::Utc>,
}

impl TaskMessage {
    /// Wrap a request with a fresh task id.
    pub fn new(request: PolicyEngineRequest) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            request,
            submitted_at: chrono::Utc::now(),
        }
    }
}

/// Revocation notice for an in-flight task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelMessage {
    pub task_id: String,
}
