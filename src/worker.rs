use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aws::load_sdk_config;
use crate::events::{ImageAction, ImageEventDetail};
use crate::records::{DynamoRecordsTable, RecordsStore, StoredRecord};
use crate::registry;
use crate::replicator::{DockerReplicator, ImageRef, ImageReplicator};
use crate::settings::{require, Settings};

/// Replay the stored records against the destination
///
/// Returns the message IDs of records that failed and should be retried.
/// Records that can never succeed (malformed bodies) are logged and dropped.
pub async fn replicate_records(
    store: &RecordsStore,
    replicator: &dyn ImageReplicator,
    records_id: &str,
) -> Result<Vec<String>> {
    let records = store.retrieve_records(records_id).await?;
    info!("[{}] Replicating {} records", records_id, records.len());

    let mut failures = Vec::new();
    for record in records {
        let Some(detail) = parse_detail(records_id, &record) else {
            continue;
        };

        let image = ImageRef::new(&detail.repository_name, &detail.image_digest);
        let result = match detail.action_type {
            ImageAction::Push => replicator.push(&image, detail.tag()).await,
            ImageAction::Delete => replicator.delete(&image, detail.tag()).await,
            ImageAction::Other(ref action) => {
                debug!("[{}] Ignoring {} of {}", records_id, action, image);
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(
                "[{}] Error processing message {} ({} {}): {:#}",
                records_id, record.message_id, detail.action_type, image, e
            );
            failures.push(record.message_id);
        }
    }

    Ok(failures)
}

fn parse_detail(records_id: &str, record: &StoredRecord) -> Option<ImageEventDetail> {
    match serde_json::from_value::<ImageEventDetail>(record.body.clone()) {
        Ok(detail) => Some(detail),
        Err(e) => {
            warn!(
                "[{}] Skipping malformed message {}: {}: {}",
                records_id, record.message_id, e, record.body
            );
            None
        }
    }
}

/// Worker entry point: replicate a records item and store the results
pub async fn run_worker(settings: &Settings, records_id: &str) -> Result<()> {
    require("DEST_REPO_REGION", &settings.dest_repo_region)?;
    require("DEST_SECRET", &settings.dest_secret)?;
    let table_name = require("RECORDS_TABLE", &settings.records_table)?;
    if records_id.trim().is_empty() {
        anyhow::bail!("records_id is required");
    }

    let docker = DockerReplicator::connect_docker().await?;
    let (src, dst) = registry::login(settings).await?;
    info!("Replicating from {} to {}", src.host, dst.host);

    let sdk_config = load_sdk_config(None, None).await;
    let table = DynamoRecordsTable::new(aws_sdk_dynamodb::Client::new(&sdk_config), table_name);
    let store = RecordsStore::new(Arc::new(table), settings.records_ttl, settings.results_ttl);

    let replicator = DockerReplicator::new(docker, src, dst);
    let failures = replicate_records(&store, &replicator, records_id).await?;

    if failures.is_empty() {
        info!("[{}] All records replicated", records_id);
    } else {
        warn!("[{}] {} records failed", records_id, failures.len());
    }

    store
        .store_results(records_id, &failures)
        .await
        .with_context(|| format!("Failed to store results for {}", records_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ItemType;
    use crate::testing::{MemoryRecordsTable, RecordingReplicator};
    use aws_lambda_events::sqs::SqsMessage;

    fn message(id: &str, body: &str) -> SqsMessage {
        let mut message = SqsMessage::default();
        message.message_id = Some(id.to_string());
        message.receipt_handle = Some(format!("handle-{}", id));
        message.body = Some(body.to_string());
        message
    }

    fn body(action: &str, digest: &str, tag: Option<&str>) -> String {
        let mut detail = serde_json::json!({
            "repository-name": "team/app",
            "image-digest": digest,
            "action-type": action,
        });
        if let Some(tag) = tag {
            detail["image-tag"] = serde_json::json!(tag);
        }
        detail.to_string()
    }

    fn store() -> (Arc<MemoryRecordsTable>, RecordsStore) {
        let table = Arc::new(MemoryRecordsTable::default());
        let store = RecordsStore::new(table.clone(), 3600, 60);
        (table, store)
    }

    #[tokio::test]
    async fn test_replicates_in_order() {
        let (table, store) = store();
        let id = store
            .store_records(&[
                message("m1", &body("PUSH", "sha256:a", Some("v1"))),
                message("m2", &body("DELETE", "sha256:b", Some("v0"))),
                message("m3", &body("DELETE", "sha256:c", None)),
            ])
            .await
            .unwrap();

        let replicator = RecordingReplicator::default();
        let failures = replicate_records(&store, &replicator, &id).await.unwrap();

        assert!(failures.is_empty());
        assert_eq!(
            replicator.calls(),
            vec![
                "push team/app@sha256:a:v1",
                "delete team/app@sha256:b:v0",
                "delete team/app@sha256:c:-",
            ]
        );
        assert!(table.item(&id, ItemType::Records).is_none());
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let (_, store) = store();
        let id = store
            .store_records(&[
                message("m1", &body("PUSH", "sha256:a", Some("v1"))),
                message("m2", &body("PUSH", "sha256:a", Some("broken"))),
                message("m3", &body("PUSH", "sha256:a", Some("v2"))),
            ])
            .await
            .unwrap();

        let replicator = RecordingReplicator::failing(&["broken"]);
        let failures = replicate_records(&store, &replicator, &id).await.unwrap();

        assert_eq!(failures, vec!["m2"]);
        assert_eq!(replicator.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let (_, store) = store();
        let id = store
            .store_records(&[
                message("m1", r#"{"repository-name": "team/app", "action-type": "PUSH"}"#),
                message("m2", "not json"),
                message("m3", r#"["PUSH"]"#),
                message("m4", &body("PUSH", "sha256:a", Some("v1"))),
            ])
            .await
            .unwrap();

        let replicator = RecordingReplicator::default();
        let failures = replicate_records(&store, &replicator, &id).await.unwrap();

        assert!(failures.is_empty());
        assert_eq!(replicator.calls(), vec!["push team/app@sha256:a:v1"]);
    }

    #[tokio::test]
    async fn test_other_actions_are_ignored() {
        let (_, store) = store();
        let id = store
            .store_records(&[message("m1", &body("SCAN", "sha256:a", Some("v1")))])
            .await
            .unwrap();

        let replicator = RecordingReplicator::default();
        let failures = replicate_records(&store, &replicator, &id).await.unwrap();

        assert!(failures.is_empty());
        assert!(replicator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_records_item() {
        let (_, store) = store();
        let replicator = RecordingReplicator::default();
        let failures = replicate_records(&store, &replicator, "gone").await.unwrap();
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn test_run_worker_requires_settings() {
        let settings = Settings::from_source([("DEST_SECRET", "replicate/dest")]).unwrap();
        let err = run_worker(&settings, "abc").await.unwrap_err();
        assert_eq!(err.to_string(), "DEST_REPO_REGION is required");

        let settings = Settings::from_source([
            ("DEST_REPO_REGION", "us-gov-west-1"),
            ("DEST_SECRET", "replicate/dest"),
            ("RECORDS_TABLE", "records"),
        ])
        .unwrap();
        let err = run_worker(&settings, " ").await.unwrap_err();
        assert_eq!(err.to_string(), "records_id is required");
    }
}
