//! Document identity.
//!
//! A document is keyed either by a hex digest of a configured unique field or
//! by the record's own `id`. Hashing follows the same value rule as item
//! deduplication: strings hash their raw bytes, anything else hashes its
//! compact JSON text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::item::Record;

/// Digest used to derive keys from the unique field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDigest {
    /// 40 hex chars. Matches keys written by earlier deployments of this pipeline.
    #[default]
    Sha1,
    Sha256,
}

impl KeyDigest {
    fn hex_digest(self, bytes: &[u8]) -> String {
        match self {
            KeyDigest::Sha1 => hex::encode(Sha1::digest(bytes)),
            KeyDigest::Sha256 => hex::encode(Sha256::digest(bytes)),
        }
    }
}

impl FromStr for KeyDigest {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(KeyDigest::Sha1),
            "sha256" => Ok(KeyDigest::Sha256),
            other => Err(PipelineError::Config(format!("unknown key digest: {}", other))),
        }
    }
}

/// Identifier of a document in the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(key: impl Into<String>) -> Self {
        DocumentKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn value_text(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Computes the key for `record`.
///
/// With `unique_field` set, the key is the hex digest of that field's value.
/// Without it, the record's `id` is used verbatim. A missing or `null` field
/// fails with [`PipelineError::MissingField`].
pub fn compute_key(
    record: &Record,
    unique_field: Option<&str>,
    digest: KeyDigest,
) -> Result<DocumentKey, PipelineError> {
    match unique_field {
        Some(field) => {
            let value = record
                .non_null(field)
                .ok_or_else(|| PipelineError::missing(field))?;
            Ok(DocumentKey(digest.hex_digest(value_text(value).as_bytes())))
        }
        None => {
            let id = record
                .non_null("id")
                .ok_or_else(|| PipelineError::missing("id"))?;
            Ok(DocumentKey(value_text(id)))
        }
    }
}
