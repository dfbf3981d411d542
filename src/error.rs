//! Error types shared by the pipeline, the merger and the index clients.

use thiserror::Error;

/// Errors raised while turning an item into an index write.
///
/// Every variant is contained at the record boundary by
/// [`ElasticsearchWriterPipeline`](crate::elasticsearch_writer::ElasticsearchWriterPipeline):
/// it is logged and the crawl moves on to the next item.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("item is missing required field `{0}`")]
    MissingField(String),

    #[error("error sending item to search index `{index}`: {source}")]
    ExternalService {
        index: String,
        #[source]
        source: IndexError,
    },

    #[error("item error: {0}")]
    ItemError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn missing(field: &str) -> Self {
        PipelineError::MissingField(field.to_string())
    }
}

/// Failures reported by an [`IndexClient`](crate::client::IndexClient).
#[derive(Debug, Error)]
pub enum IndexError {
    #[cfg(feature = "elasticsearch")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("index returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response from index: {0}")]
    UnexpectedResponse(String),

    #[error("merge script failed: {0}")]
    Script(String),
}
