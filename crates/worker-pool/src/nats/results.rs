//! Run status written to the JetStream key-value result bucket.

use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream::{kv, Context};
use async_trait::async_trait;
use policy_engine::RunStatus;

/// Retention for result entries, matching the control plane.
const RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Destination for a run's status as it progresses.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn put(&self, task_id: &str, status: &RunStatus) -> Result<()>;

    /// Currently stored status, if any.
    async fn get(&self, task_id: &str) -> Result<Option<RunStatus>>;
}

/// Result bucket keyed by task id.
#[derive(Clone)]
pub struct ResultStore {
    store: kv::Store,
}

impl ResultStore {
    /// Open the bucket, creating it when missing.
    pub async fn open(js: &Context, bucket: &str) -> Result<Self> {
        let store = match js.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => {
                let store = js
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        max_age: RETENTION,
                        ..Default::default()
                    })
                    .await?;
                tracing::info!(bucket = %bucket, "Created NATS result bucket");
                store
            }
        };
        Ok(Self { store })
    }
}

#[async_trait]
impl StatusSink for ResultStore {
    async fn put(&self, task_id: &str, status: &RunStatus) -> Result<()> {
        let payload = serde_json::to_vec(status)?;
        self.store.put(task_id, payload.into()).await?;
        tracing::trace!(task_id = %task_id, status = status.kind(), "Stored run status");
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<RunStatus>> {
        match self.store.get(task_id).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
