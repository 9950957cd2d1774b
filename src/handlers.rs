use anyhow::{Context, Result};
use aws_lambda_events::eventbridge::EventBridgeEvent;
use aws_lambda_events::sqs::SqsEvent;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::events::{BatchResults, ImageEventDetail};
use crate::launcher::{Deadline, WorkerLauncher};
use crate::queue::ImageQueue;
use crate::records::RecordsStore;

/// Which Lambda entry point this process serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Event,
    Queue,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Event => "event_handler",
            HandlerKind::Queue => "queue_handler",
        }
    }
}

impl FromStr for HandlerKind {
    type Err = anyhow::Error;

    /// Accepts `event_handler`, `queue_handler`, or either with a module
    /// prefix as found in `_HANDLER` (e.g. `partition_ecr_replicate.queue_handler`)
    fn from_str(s: &str) -> Result<Self> {
        let name = s.rsplit('.').next().unwrap_or(s).trim();
        match name {
            "event_handler" | "event" => Ok(HandlerKind::Event),
            "queue_handler" | "queue" => Ok(HandlerKind::Queue),
            _ => anyhow::bail!("Unknown handler: {}", s),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue a replicated ECR image action for the queue Lambda
///
/// Actions other than PUSH and DELETE are skipped. Messages are grouped by
/// repository and tag so actions on the same tag stay in order.
pub async fn event_handler(
    queue: &dyn ImageQueue,
    event: EventBridgeEvent<ImageEventDetail>,
) -> Result<()> {
    let detail = event.detail;
    let image = format!("{}@{}", detail.repository_name, detail.image_digest);
    debug!("[{}] Handling {} event", image, detail.action_type);

    if !detail.action_type.is_replicated() {
        debug!("[{}] Skipping: {}", image, detail.action_type);
        return Ok(());
    }

    let group_id = detail.message_group_id();
    let body = serde_json::to_string(&detail).context("Failed to serialize event detail")?;
    let message_id = queue.send(body, group_id.clone()).await?;

    info!(
        "[{}] Queued {} as message {} in group {}",
        image, detail.action_type, message_id, group_id
    );
    Ok(())
}

/// Hand an SQS batch to a worker and report which messages failed
///
/// Any error here fails the whole invocation, so SQS retries the whole batch.
pub async fn queue_handler(
    store: &RecordsStore,
    launcher: &dyn WorkerLauncher,
    event: SqsEvent,
    deadline: &Deadline,
) -> Result<BatchResults> {
    if event.records.is_empty() {
        debug!("Empty batch, nothing to replicate");
        return Ok(BatchResults::default());
    }

    let records_id = store.store_records(&event.records).await?;
    info!("[{}] Stored {} records", records_id, event.records.len());

    let handle = launcher.start(&records_id, deadline).await?;
    launcher.join(&handle, deadline).await?;

    let results = store.retrieve_results(&records_id).await?;
    info!(
        "[{}] Worker reported {} failures",
        records_id,
        results.batch_item_failures.len()
    );
    debug!(
        "[{}] Failed messages: {:?}",
        records_id,
        results.failed_ids().collect::<Vec<_>>()
    );
    Ok(results)
}
