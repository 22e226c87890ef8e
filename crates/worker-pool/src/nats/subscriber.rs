//! NATS JetStream subscriber for task messages.

use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, Context};
use futures::StreamExt;
use policy_engine::task::TaskMessage;

/// Retention for task messages, matching the control plane.
const RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Pulls [`TaskMessage`]s from the task stream through a durable consumer
/// shared by every worker in the pool.
pub struct NatsSubscriber {
    consumer: jetstream::consumer::Consumer<ConsumerConfig>,
}

impl NatsSubscriber {
    /// Make sure the stream and durable consumer exist.
    pub async fn connect(js: &Context, stream: &str, subject: &str, consumer: &str) -> Result<Self> {
        // Try to get existing stream or create new one
        let stream_handle = match js.get_stream(stream).await {
            Ok(existing) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                existing
            }
            Err(_) => {
                let created = js
                    .create_stream(jetstream::stream::Config {
                        name: stream.to_string(),
                        subjects: vec![subject.to_string()],
                        max_age: RETENTION,
                        storage: jetstream::stream::StorageType::File,
                        ..Default::default()
                    })
                    .await?;
                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                created
            }
        };

        let consumer_handle = match stream_handle.get_consumer(consumer).await {
            Ok(existing) => existing,
            Err(_) => {
                let created = stream_handle
                    .create_consumer(ConsumerConfig {
                        durable_name: Some(consumer.to_string()),
                        filter_subject: subject.to_string(),
                        ..Default::default()
                    })
                    .await?;
                tracing::info!(consumer = %consumer, "Created NATS consumer");
                created
            }
        };

        Ok(Self {
            consumer: consumer_handle,
        })
    }

    /// Receive the next task, if one is waiting.
    ///
    /// The message is acknowledged on receipt: a run is attempted at most
    /// once. Undecodable messages are terminated and skipped.
    pub async fn receive(&self) -> Result<Option<TaskMessage>> {
        let mut messages = self.consumer.fetch().max_messages(1).messages().await?;

        let Some(msg) = messages.next().await else {
            return Ok(None);
        };
        let msg = msg.map_err(|e| anyhow::anyhow!("Failed to receive message: {}", e))?;

        match serde_json::from_slice::<TaskMessage>(&msg.payload) {
            Ok(task) => {
                msg.ack()
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to ack message: {}", e))?;
                Ok(Some(task))
            }
            Err(e) => {
                tracing::error!(error = %e, subject = %msg.subject, "Discarding undecodable task message");
                msg.ack_with(jetstream::AckKind::Term)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to terminate message: {}", e))?;
                Ok(None)
            }
        }
    }
}
