//! Records and results hand-off between the queue Lambda and the worker
//!
//! The queue Lambda writes the SQS batch as a `records` item, the worker reads
//! (and deletes) it, replicates, and writes a `results` item that the queue
//! Lambda reads (and deletes) to build its partial batch response. Both items
//! carry an `Expires` TTL so nothing lingers if either side dies.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_lambda_events::sqs::SqsMessage;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::aws::format_sdk_error;
use crate::events::BatchResults;

/// A DynamoDB item as stored in the records table
pub type Item = HashMap<String, AttributeValue>;

/// Range key (`Type`) of the records table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    Records,
    Results,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Records => "records",
            ItemType::Results => "results",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordsError {
    #[error("{kind} item {id} already exists")]
    AlreadyExists { id: String, kind: ItemType },
}

/// One SQS message as handed to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoredRecord {
    pub message_id: String,
    pub receipt_handle: String,
    /// The decoded message body, or the raw body string if it wasn't JSON
    pub body: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordsItem {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Records")]
    records: Vec<StoredRecord>,
    #[serde(rename = "Expires")]
    expires: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResultsItem {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Results")]
    results: BatchResults,
    #[serde(rename = "Expires")]
    expires: i64,
}

/// Item-level access to the records table
#[async_trait]
pub trait RecordsTable: Send + Sync {
    /// Put an item; with `only_if_new` an existing item with the same key is
    /// an [`RecordsError::AlreadyExists`] error
    async fn put(&self, item: Item, only_if_new: bool) -> Result<()>;

    async fn get(&self, id: &str, kind: ItemType) -> Result<Option<Item>>;

    async fn delete(&self, id: &str, kind: ItemType) -> Result<()>;
}

/// DynamoDB implementation of [`RecordsTable`]
///
/// Table layout: hash key `ID` (S), range key `Type` (S), TTL on `Expires`.
pub struct DynamoRecordsTable {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoRecordsTable {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl RecordsTable for DynamoRecordsTable {
    async fn put(&self, item: Item, only_if_new: bool) -> Result<()> {
        let id = match item.get("ID") {
            Some(AttributeValue::S(id)) => id.clone(),
            _ => anyhow::bail!("Item has no ID attribute"),
        };
        let kind = match item.get("Type") {
            Some(AttributeValue::S(kind)) if kind == ItemType::Results.as_str() => {
                ItemType::Results
            }
            _ => ItemType::Records,
        };

        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item));
        if only_if_new {
            request = request.condition_expression("attribute_not_exists(ID)");
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let message = format_sdk_error(&err);
                match err.into_service_error() {
                    PutItemError::ConditionalCheckFailedException(_) => {
                        Err(RecordsError::AlreadyExists { id, kind }.into())
                    }
                    _ => Err(anyhow::anyhow!(
                        "Failed to put {} item {} into {}: {}",
                        kind,
                        id,
                        self.table_name,
                        message
                    )),
                }
            }
        }
    }

    async fn get(&self, id: &str, kind: ItemType) -> Result<Option<Item>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("ID", AttributeValue::S(id.to_string()))
            .key("Type", AttributeValue::S(kind.as_str().to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to get {} item {} from {}: {}",
                    kind,
                    id,
                    self.table_name,
                    format_sdk_error(&e)
                )
            })?;

        Ok(response.item)
    }

    async fn delete(&self, id: &str, kind: ItemType) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key("ID", AttributeValue::S(id.to_string()))
            .key("Type", AttributeValue::S(kind.as_str().to_string()))
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to delete {} item {} from {}: {}",
                    kind,
                    id,
                    self.table_name,
                    format_sdk_error(&e)
                )
            })?;

        Ok(())
    }
}

impl StoredRecord {
    /// Convert an SQS message, decoding its body as JSON when possible
    pub fn from_sqs(message: &SqsMessage, records_id: &str) -> Self {
        let raw_body = message.body.clone().unwrap_or_default();
        let body = match serde_json::from_str::<serde_json::Value>(&raw_body) {
            Ok(value) => value,
            Err(e) => {
                error!(
                    "[{}] Unable to decode record body ({}): {}",
                    records_id, e, raw_body
                );
                serde_json::Value::String(raw_body)
            }
        };

        Self {
            message_id: message.message_id.clone().unwrap_or_default(),
            receipt_handle: message.receipt_handle.clone().unwrap_or_default(),
            body,
        }
    }
}

/// Records/results store with the hand-off semantics on top of a table
#[derive(Clone)]
pub struct RecordsStore {
    table: Arc<dyn RecordsTable>,
    records_ttl: i64,
    results_ttl: i64,
}

impl RecordsStore {
    pub fn new(table: Arc<dyn RecordsTable>, records_ttl: u64, results_ttl: u64) -> Self {
        Self {
            table,
            records_ttl: i64::try_from(records_ttl).unwrap_or(i64::MAX),
            results_ttl: i64::try_from(results_ttl).unwrap_or(i64::MAX),
        }
    }

    /// Store a batch of SQS messages under a fresh records ID
    ///
    /// The TTL should match the queue's visibility timeout: once the messages
    /// become visible again the stored copy is useless.
    pub async fn store_records(&self, messages: &[SqsMessage]) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let records: Vec<StoredRecord> = messages
            .iter()
            .map(|m| StoredRecord::from_sqs(m, &id))
            .collect();

        debug!("[{}] Storing {} records", id, records.len());

        let item = serde_dynamo::to_item(RecordsItem {
            id: id.clone(),
            kind: ItemType::Records.as_str().to_string(),
            records,
            expires: chrono::Utc::now().timestamp().saturating_add(self.records_ttl),
        })
        .context("Failed to serialize records item")?;

        self.table.put(item, false).await?;
        Ok(id)
    }

    /// Store the worker results for a records ID
    ///
    /// Fails if results were already stored for this ID.
    pub async fn store_results(&self, id: &str, failure_message_ids: &[String]) -> Result<()> {
        debug!(
            "[{}] Storing {} failure results",
            id,
            failure_message_ids.len()
        );

        let item = serde_dynamo::to_item(ResultsItem {
            id: id.to_string(),
            kind: ItemType::Results.as_str().to_string(),
            results: BatchResults::from_failures(failure_message_ids.iter().cloned()),
            expires: chrono::Utc::now().timestamp().saturating_add(self.results_ttl),
        })
        .context("Failed to serialize results item")?;

        self.table.put(item, true).await
    }

    /// Read the stored records, deleting the item whether or not it was read
    pub async fn retrieve_records(&self, id: &str) -> Result<Vec<StoredRecord>> {
        let result = self.table.get(id, ItemType::Records).await;
        self.delete_quietly(id, ItemType::Records).await;

        match result? {
            Some(item) => {
                let item: RecordsItem =
                    serde_dynamo::from_item(item).context("Failed to decode records item")?;
                Ok(item.records)
            }
            None => {
                warn!("[{}] No records found", id);
                Ok(Vec::new())
            }
        }
    }

    /// Read the stored results, deleting the item whether or not it was read
    pub async fn retrieve_results(&self, id: &str) -> Result<BatchResults> {
        let result = self.table.get(id, ItemType::Results).await;
        self.delete_quietly(id, ItemType::Results).await;

        match result? {
            Some(item) => {
                let item: ResultsItem =
                    serde_dynamo::from_item(item).context("Failed to decode results item")?;
                Ok(item.results)
            }
            None => {
                warn!("[{}] No results found", id);
                Ok(BatchResults::default())
            }
        }
    }

    async fn delete_quietly(&self, id: &str, kind: ItemType) {
        debug!("[{}] Deleting {} item", id, kind);
        if let Err(e) = self.table.delete(id, kind).await {
            error!("[{}] Unable to delete {}: {:#}", id, kind, e);
        }
    }
}
