//! # Service Context Store
//!
//! Persistence contract for suspended service contexts. The core only
//! requires that `get` after `store` returns an equivalent record and that
//! `delete` is idempotent; where the records live (memory, KV store, files)
//! is up to the implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::error::Error;
use crate::service::SerializedContext;

/// Persisted record of one suspended context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredContext {
    pub channel: Channel,
    pub state: SerializedContext,
}

/// Persistence contract consumed by the execution runner.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Persist `record` under `key`, replacing any previous record.
    async fn store(&self, key: &str, record: &StoredContext) -> Result<(), Error>;

    /// Fetch the record stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<StoredContext>, Error>;

    /// Remove the record stored under `key`. Idempotent.
    async fn delete(&self, key: &str) -> Result<(), Error>;
}

/// In-process store keyed by service channel id.
#[derive(Debug, Default)]
pub struct MemoryContextStore {
    entries: Mutex<HashMap<String, StoredContext>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn store(&self, key: &str, record: &StoredContext) -> Result<(), Error> {
        self.entries
            .lock()
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredContext>, Error> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
