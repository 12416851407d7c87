use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::PlannerError;

/// Structured-state sink the pipeline persists outlines and checkpoints to.
#[async_trait]
pub trait OutlineStore: Send + Sync {
    async fn write(&self, collection: &str, record: Value) -> Result<(), PlannerError>;

    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>, PlannerError>;
}

/// In-process store. A record whose `id` matches an existing one replaces it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

#[async_trait]
impl OutlineStore for MemoryStore {
    async fn write(&self, collection: &str, record: Value) -> Result<(), PlannerError> {
        if !record.is_object() {
            return Err(PlannerError::Storage(format!(
                "records written to '{collection}' must be JSON objects"
            )));
        }

        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();
        let existing = record_id(&record)
            .and_then(|id| records.iter().position(|r| record_id(r) == Some(id)));
        match existing {
            Some(pos) => records[pos] = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>, PlannerError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|records| records.iter().find(|r| record_id(r) == Some(id)).cloned()))
    }
}
