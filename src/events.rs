use serde::{Deserialize, Serialize};
use std::fmt;

/// ECR image action reported by EventBridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageAction {
    Push,
    Delete,
    /// Any action we do not replicate (e.g. a future action type)
    Other(String),
}

impl ImageAction {
    pub fn as_str(&self) -> &str {
        match self {
            ImageAction::Push => "PUSH",
            ImageAction::Delete => "DELETE",
            ImageAction::Other(s) => s,
        }
    }

    /// Whether this action is replicated to the destination partition
    pub fn is_replicated(&self) -> bool {
        matches!(self, ImageAction::Push | ImageAction::Delete)
    }
}

impl From<String> for ImageAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PUSH" => ImageAction::Push,
            "DELETE" => ImageAction::Delete,
            _ => ImageAction::Other(s),
        }
    }
}

impl Serialize for ImageAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ImageAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(ImageAction::from)
    }
}

impl fmt::Display for ImageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `detail` of an "ECR Image Action" EventBridge event
///
/// Fields we don't use (`result`, ...) are kept in `extra` so the queued
/// message body is the detail exactly as ECR sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageEventDetail {
    pub repository_name: String,
    pub image_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    pub action_type: ImageAction,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ImageEventDetail {
    /// The image tag, treating an empty tag as no tag
    pub fn tag(&self) -> Option<&str> {
        self.image_tag.as_deref().filter(|t| !t.is_empty())
    }

    /// FIFO message group for this event
    ///
    /// Events for the same repository and tag are delivered in order;
    /// untagged events are ordered per repository.
    pub fn message_group_id(&self) -> String {
        match self.tag() {
            Some(tag) => format!("{}:{}", self.repository_name, tag),
            None => self.repository_name.clone(),
        }
    }
}

/// One entry of a partial batch response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Lambda partial batch response for SQS event sources
///
/// Serialized as `{"batchItemFailures": [{"itemIdentifier": "..."}]}`; the
/// listed messages stay on the queue and are retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResults {
    #[serde(default)]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchResults {
    pub fn from_failures<I, S>(message_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            batch_item_failures: message_ids
                .into_iter()
                .map(|id| BatchItemFailure {
                    item_identifier: id.into(),
                })
                .collect(),
        }
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
    }
}
