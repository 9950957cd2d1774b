//! In-memory stand-ins for the AWS and Docker seams, used by unit tests

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::launcher::{Deadline, WorkerHandle, WorkerLauncher};
use crate::queue::ImageQueue;
use crate::records::{Item, ItemType, RecordsError, RecordsStore, RecordsTable};
use crate::replicator::{ImageRef, ImageReplicator};

#[derive(Default)]
pub struct MemoryRecordsTable {
    items: Mutex<HashMap<(String, String), Item>>,
    fail_deletes: AtomicBool,
}

impl MemoryRecordsTable {
    pub fn item(&self, id: &str, kind: ItemType) -> Option<Item> {
        self.items
            .lock()
            .unwrap()
            .get(&(id.to_string(), kind.as_str().to_string()))
            .cloned()
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

fn string_attr(item: &Item, name: &str) -> String {
    match item.get(name) {
        Some(AttributeValue::S(s)) => s.clone(),
        other => panic!("item attribute {} is not a string: {:?}", name, other),
    }
}

#[async_trait]
impl RecordsTable for MemoryRecordsTable {
    async fn put(&self, item: Item, only_if_new: bool) -> Result<()> {
        let key = (string_attr(&item, "ID"), string_attr(&item, "Type"));
        let mut items = self.items.lock().unwrap();
        if only_if_new && items.contains_key(&key) {
            let kind = if key.1 == "results" {
                ItemType::Results
            } else {
                ItemType::Records
            };
            return Err(RecordsError::AlreadyExists { id: key.0, kind }.into());
        }
        items.insert(key, item);
        Ok(())
    }

    async fn get(&self, id: &str, kind: ItemType) -> Result<Option<Item>> {
        Ok(self.item(id, kind))
    }

    async fn delete(&self, id: &str, kind: ItemType) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("delete refused");
        }
        self.items
            .lock()
            .unwrap()
            .remove(&(id.to_string(), kind.as_str().to_string()));
        Ok(())
    }
}

/// Queue that records what was sent
#[derive(Default)]
pub struct MemoryQueue {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ImageQueue for MemoryQueue {
    async fn send(&self, body: String, group_id: String) -> Result<String> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((body, group_id));
        Ok(format!("msg-{}", sent.len()))
    }
}

/// Replicator that records calls and fails for selected tags
#[derive(Default)]
pub struct RecordingReplicator {
    pub calls: Mutex<Vec<String>>,
    pub failing_tags: Vec<String>,
}

impl RecordingReplicator {
    pub fn failing(tags: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing_tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, tag: Option<&str>) -> Result<()> {
        if let Some(tag) = tag {
            if self.failing_tags.iter().any(|t| t == tag) {
                anyhow::bail!("replication of {} failed", tag);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageReplicator for RecordingReplicator {
    async fn push(&self, image: &ImageRef, tag: Option<&str>) -> Result<()> {
        self.calls.lock().unwrap().push(format!(
            "push {}@{}:{}",
            image.repo_name,
            image.image_digest,
            tag.unwrap_or("-")
        ));
        self.check(tag)
    }

    async fn delete(&self, image: &ImageRef, tag: Option<&str>) -> Result<()> {
        self.calls.lock().unwrap().push(format!(
            "delete {}@{}:{}",
            image.repo_name,
            image.image_digest,
            tag.unwrap_or("-")
        ));
        self.check(tag)
    }
}

/// Launcher that "runs" the worker inline by writing canned results
pub struct InlineLauncher {
    pub store: RecordsStore,
    pub failures: Vec<String>,
    pub fail_join: bool,
    pub started: Mutex<Vec<String>>,
}

impl InlineLauncher {
    pub fn new(store: RecordsStore, failures: &[&str]) -> Self {
        Self {
            store,
            failures: failures.iter().map(|f| f.to_string()).collect(),
            fail_join: false,
            started: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WorkerLauncher for InlineLauncher {
    async fn start(&self, records_id: &str, _deadline: &Deadline) -> Result<WorkerHandle> {
        self.started.lock().unwrap().push(records_id.to_string());
        Ok(WorkerHandle {
            id: format!("worker-{}", records_id),
            records_id: records_id.to_string(),
        })
    }

    async fn join(&self, handle: &WorkerHandle, _deadline: &Deadline) -> Result<()> {
        if self.fail_join {
            anyhow::bail!("worker {} failed", handle.id);
        }
        // Consume the records like the worker would
        self.store.retrieve_records(&handle.records_id).await?;
        self.store
            .store_results(&handle.records_id, &self.failures)
            .await
    }
}
