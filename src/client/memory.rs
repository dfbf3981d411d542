//! In-process index that evaluates merge scripts locally.
//!
//! Useful for dry runs and tests: it follows the same create-or-patch rules as
//! a real index, keyed by `(index, key)`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::trace;

use super::{IndexClient, UpsertRequest, WriteOutcome};
use crate::error::IndexError;

#[derive(Debug, Default)]
pub struct InMemoryIndex {
    documents: Mutex<HashMap<(String, String), Value>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `doc` under `key`, replacing whatever was there.
    pub async fn insert(&self, index: &str, key: &str, doc: Value) {
        self.documents
            .lock()
            .await
            .insert((index.to_string(), key.to_string()), doc);
    }

    pub async fn get(&self, index: &str, key: &str) -> Option<Value> {
        self.documents
            .lock()
            .await
            .get(&(index.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }
}

#[async_trait]
impl IndexClient for InMemoryIndex {
    async fn upsert_with_patch(&self, request: &UpsertRequest) -> Result<WriteOutcome, IndexError> {
        let mut documents = self.documents.lock().await;
        let slot = (request.index.clone(), request.key.as_str().to_string());

        match documents.entry(slot) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                // Work on a copy so a failing script leaves the stored document intact.
                let mut patched = existing.clone();
                request.script.apply_to(&mut patched, &request.params)?;
                if patched == *existing {
                    trace!("Document {} unchanged by script", request.key);
                    return Ok(WriteOutcome::Noop);
                }
                *existing = patched;
                Ok(WriteOutcome::Updated)
            }
            Entry::Vacant(entry) => {
                entry.insert(request.upsert.clone());
                Ok(WriteOutcome::Created)
            }
        }
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
