//! Search index clients.
//!
//! The writer pipeline talks to the index through [`IndexClient`], which needs
//! exactly one capability: apply a [`MergeScript`] to the document stored
//! under a key, or insert a fallback document when there is none, atomically,
//! and say which of the two happened.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::IndexError;
use crate::key::DocumentKey;
use crate::merge::{MergeScript, Params};

#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
pub mod memory;

#[cfg(feature = "elasticsearch")]
pub use elasticsearch::ElasticsearchClient;
pub use memory::InMemoryIndex;

/// A scripted update with an insert fallback for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRequest {
    pub index: String,
    pub doc_type: Option<String>,
    pub key: DocumentKey,
    /// Patch applied when a document exists under `key`.
    pub script: MergeScript,
    pub params: Params,
    /// Document inserted when nothing exists under `key`.
    pub upsert: Value,
}

/// What the index did with an [`UpsertRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No document existed; the fallback document was inserted.
    Created,
    /// The script was applied to the existing document.
    Updated,
    /// The script ran but left the existing document unchanged. Both clients
    /// report this for the same requests: the rendered Painless script flags
    /// itself as `noop` when none of its ops altered the document.
    Noop,
}

impl WriteOutcome {
    pub fn is_new(self) -> bool {
        self == WriteOutcome::Created
    }
}

#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Applies `request.script` to the stored document, or inserts `request.upsert`.
    async fn upsert_with_patch(&self, request: &UpsertRequest) -> Result<WriteOutcome, IndexError>;

    /// Short backend name used in log lines.
    fn backend_name(&self) -> &str;
}

#[async_trait]
impl<T: IndexClient + ?Sized> IndexClient for Arc<T> {
    async fn upsert_with_patch(&self, request: &UpsertRequest) -> Result<WriteOutcome, IndexError> {
        (**self).upsert_with_patch(request).await
    }

    fn backend_name(&self) -> &str {
        (**self).backend_name()
    }
}
