//! Repository Module
//!
//! Boundary to the remote data store: request/response access and the
//! push-based change feed.

mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RepoError;

pub use memory::{MemoryBackend, Procedure};

// == Write Operations ==
/// Kind of write sent to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
    /// Remote procedure call by name
    Invoke(String),
}

// == Change Events ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Notification pushed by the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub change_type: ChangeType,
    pub entity: String,
    pub id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl ChangeEvent {
    pub fn new(
        change_type: ChangeType,
        entity: impl Into<String>,
        id: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            change_type,
            entity: entity.into(),
            id,
            payload,
        }
    }

    /// Top-level payload field, if the payload is an object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// Server-side filter on a subscription: `payload[field] == value`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    pub field: String,
    pub value: Value,
}

impl ChangeFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.field(&self.field) == Some(&self.value)
    }
}

// == Repository Trait ==
/// Asynchronous access to the remote store.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Reads `entity` rows matching `params`.
    async fn fetch(&self, entity: &str, params: &Value) -> Result<Value, RepoError>;

    /// Applies a write and returns the authoritative result.
    async fn write(&self, entity: &str, op: WriteOp, payload: Value) -> Result<Value, RepoError>;
}

// == Realtime Channel Trait ==
/// Push-based change feed.
///
/// Dropping the returned stream unsubscribes.
pub trait RealtimeChannel: Send + Sync {
    fn subscribe(
        &self,
        entity: &str,
        filter: Option<ChangeFilter>,
    ) -> BoxStream<'static, ChangeEvent>;
}
