//! In-memory `DocumentStore`, used when no external persistence is configured and in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::error::ServiceError;
use crate::services::DocumentStore;

pub const SESSIONS: &str = "sessions";
/// Question id -> owning session id.
pub const QUESTIONS: &str = "questions";

#[derive(Clone, Default)]
pub struct MemoryStore {
    docs: Arc<RwLock<HashMap<(String, String), Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, ServiceError> {
        let docs = self.docs.read().await;
        Ok(docs.get(&(collection.to_string(), key.to_string())).cloned())
    }

    #[instrument(level = "debug", skip(self, doc))]
    async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<(), ServiceError> {
        self.docs
            .write()
            .await
            .insert((collection.to_string(), key.to_string()), doc);
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, ServiceError> {
        let removed = self
            .docs
            .write()
            .await
            .remove(&(collection.to_string(), key.to_string()));
        Ok(removed.is_some())
    }
}
