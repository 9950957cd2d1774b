use anyhow::Result;
use async_trait::async_trait;

use crate::aws::format_sdk_error;

/// Destination for image events (the SQS FIFO queue)
#[async_trait]
pub trait ImageQueue: Send + Sync {
    /// Send a message in a message group, returning the SQS message ID
    async fn send(&self, body: String, group_id: String) -> Result<String>;
}

/// SQS FIFO queue addressed by URL
///
/// The queue is expected to have content-based deduplication enabled, so no
/// deduplication ID is sent.
pub struct SqsImageQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsImageQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl ImageQueue for SqsImageQueue {
    async fn send(&self, body: String, group_id: String) -> Result<String> {
        let response = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_group_id(&group_id)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to send message to {} (group {}): {}",
                    self.queue_url,
                    group_id,
                    format_sdk_error(&e)
                )
            })?;

        Ok(response.message_id().unwrap_or_default().to_string())
    }
}
