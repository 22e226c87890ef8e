//! NATS JetStream task backend.
//!
//! Architecture:
//! - `submit` writes `submitted` to the result bucket, then publishes a
//!   [`TaskMessage`] on the task subject
//! - Workers consume the stream, execute the run and keep the bucket entry
//!   for the task id current (in progress, then complete)
//! - `status` reads the bucket; `cancel` publishes a [`CancelMessage`] on a
//!   core subject every worker listens to
//! - A run still `submitted` is also marked cancelled in the bucket, which a
//!   worker checks before it starts executing

use std::time::Duration;

use async_nats::jetstream::{self, kv, Context};
use async_trait::async_trait;
use policy_engine::task::{CancelMessage, TaskMessage};
use policy_engine::{PolicyEngineRequest, RunStatus};

use super::{validate_request, TaskBackend};
use crate::config::{AppConfig, BackendKind};
use crate::error::{AppError, AppResult};

/// Retention for task messages and result entries.
const RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Dispatches runs to the worker pool.
pub struct NatsBackend {
    client: async_nats::Client,
    js: Context,
    results: kv::Store,
    subject: String,
    cancel_subject: String,
}

impl NatsBackend {
    /// Connect and make sure the task stream and result bucket exist.
    pub async fn connect(config: &AppConfig) -> AppResult<Self> {
        let url = config
            .nats_url
            .as_deref()
            .ok_or_else(|| AppError::Config("POLICY_ENGINE_NATS_URL is required for the nats backend".to_string()))?;

        let client = async_nats::connect(url)
            .await
            .map_err(|e| AppError::Nats(format!("Failed to connect to {url}: {e}")))?;
        let js = jetstream::new(client.clone());

        Self::ensure_stream(&js, &config.nats_stream, &config.nats_subject).await?;
        let results = Self::ensure_bucket(&js, &config.result_bucket).await?;

        tracing::info!(
            url = %url,
            stream = %config.nats_stream,
            bucket = %config.result_bucket,
            "Connected NATS task backend"
        );

        Ok(Self {
            client,
            js,
            results,
            subject: config.nats_subject.clone(),
            cancel_subject: config.nats_cancel_subject.clone(),
        })
    }

    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> AppResult<()> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    max_age: RETENTION,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| AppError::Nats(e.to_string()))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }

    async fn ensure_bucket(js: &Context, bucket: &str) -> AppResult<kv::Store> {
        match js.get_key_value(bucket).await {
            Ok(store) => Ok(store),
            Err(_) => {
                let store = js
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        max_age: RETENTION,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| AppError::Nats(e.to_string()))?;

                tracing::info!(bucket = %bucket, "Created NATS result bucket");
                Ok(store)
            }
        }
    }
}

/// Decode a result bucket entry; a missing entry means the id is unknown.
fn decode_status(task_id: &str, entry: Option<&[u8]>) -> AppResult<RunStatus> {
    match entry {
        Some(bytes) => Ok(serde_json::from_slice::<RunStatus>(bytes)?.with_id(task_id)),
        None => Ok(RunStatus::unknown(task_id)),
    }
}

/// Status to store when cancelling a run no worker has picked up yet.
fn pending_cancel_marker(task_id: &str, current: &RunStatus) -> Option<RunStatus> {
    match current {
        RunStatus::Submitted(_) => Some(RunStatus::cancelled(task_id)),
        _ => None,
    }
}

#[async_trait]
impl TaskBackend for NatsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nats
    }

    async fn submit(&self, request: PolicyEngineRequest) -> AppResult<RunStatus> {
        validate_request(&request)?;

        let message = TaskMessage::new(request);
        let status = RunStatus::submitted(message.task_id.clone());

        self.results
            .put(&message.task_id, serde_json::to_vec(&status)?.into())
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;

        self.js
            .publish(self.subject.clone(), serde_json::to_vec(&message)?.into())
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;

        tracing::info!(task_id = %message.task_id, subject = %self.subject, "Published task");
        Ok(status)
    }

    async fn status(&self, task_id: &str) -> AppResult<RunStatus> {
        let entry = self
            .results
            .get(task_id)
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;
        decode_status(task_id, entry.as_deref())
    }

    async fn cancel(&self, task_id: &str) -> AppResult<RunStatus> {
        let entry = self
            .results
            .entry(task_id)
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?
            .filter(|entry| matches!(entry.operation, kv::Operation::Put));
        let current = decode_status(task_id, entry.as_ref().map(|e| &e.value[..]))?;
        if matches!(current, RunStatus::Unknown(_)) || current.is_terminal() {
            return Ok(current);
        }

        let mut reply = current;
        if let (Some(marker), Some(entry)) = (pending_cancel_marker(task_id, &reply), entry.as_ref()) {
            // A failed update means a worker already took the run; the
            // published cancellation reaches it instead.
            match self
                .results
                .update(task_id, serde_json::to_vec(&marker)?.into(), entry.revision)
                .await
            {
                Ok(_) => {
                    tracing::info!(task_id = %task_id, "Marked queued run cancelled");
                    reply = marker;
                }
                Err(e) => {
                    tracing::debug!(task_id = %task_id, error = %e, "Run left the queue before cancellation")
                }
            }
        }

        let message = CancelMessage {
            task_id: task_id.to_string(),
        };
        self.client
            .publish(self.cancel_subject.clone(), serde_json::to_vec(&message)?.into())
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;

        tracing::info!(task_id = %task_id, subject = %self.cancel_subject, "Published cancellation");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_missing_entry_is_unknown() {
        assert_eq!(decode_status("t1", None).unwrap(), RunStatus::unknown("t1"));
    }

    #[test]
    fn test_decode_stored_status() {
        let stored = serde_json::to_vec(&RunStatus::failed("t1", "boom", "")).unwrap();
        let status = decode_status("t1", Some(stored.as_slice())).unwrap();
        assert_eq!(status.kind(), "complete");
        assert_eq!(status.id(), Some("t1"));
    }

    #[test]
    fn test_only_queued_runs_get_cancel_marker() {
        let marker = pending_cancel_marker("t1", &RunStatus::submitted("t1")).unwrap();
        assert_eq!(marker.kind(), "complete");
        assert!(marker.is_terminal());

        let running = RunStatus::InProgress(policy_engine::status::InProgressDetail::new("t1"));
        assert!(pending_cancel_marker("t1", &running).is_none());
    }

    #[test]
    fn test_decode_corrupt_entry_is_error() {
        assert!(matches!(
            decode_status("t1", Some(&b"not json"[..])),
            Err(AppError::Serialization(_))
        ));
    }

    fn nats_config() -> Option<AppConfig> {
        let url = std::env::var("NATS_URL").ok()?;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Some(AppConfig {
            backend: BackendKind::Nats,
            nats_url: Some(url),
            nats_stream: format!("policy_engine_test_{suffix}"),
            nats_subject: format!("policy_engine.test.{suffix}"),
            nats_cancel_subject: format!("policy_engine.test.{suffix}.cancel"),
            result_bucket: format!("policy_engine_test_{suffix}"),
            ..AppConfig::default()
        })
    }

    fn request() -> PolicyEngineRequest {
        PolicyEngineRequest::new(
            policy_engine::Workflow::from_yaml_str("jobs:\n  j:\n    steps:\n      - run: echo ok\n").unwrap(),
        )
    }

    #[tokio::test]
    #[ignore] // Requires a NATS server with JetStream (NATS_URL)
    async fn test_submit_status_and_cancel_queued_run() {
        let Some(config) = nats_config() else {
            return;
        };
        let backend = NatsBackend::connect(&config).await.unwrap();

        let missing = backend.status("no-such-task").await.unwrap();
        assert_eq!(missing, RunStatus::unknown("no-such-task"));

        let submitted = backend.submit(request()).await.unwrap();
        let task_id = submitted.id().unwrap().to_string();
        assert_eq!(submitted.kind(), "submitted");
        assert_eq!(backend.status(&task_id).await.unwrap(), submitted);

        let stream = backend.js.get_stream(&config.nats_stream).await.unwrap();
        assert_eq!(stream.cached_info().state.messages, 1);

        let cancelled = backend.cancel(&task_id).await.unwrap();
        assert_eq!(cancelled, RunStatus::cancelled(&task_id));
        assert_eq!(backend.status(&task_id).await.unwrap(), cancelled);

        backend.js.delete_stream(&config.nats_stream).await.unwrap();
        backend.js.delete_key_value(&config.result_bucket).await.unwrap();
    }
}
