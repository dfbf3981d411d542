//! # spider-pipeline-elasticsearch
//!
//! Elasticsearch item pipeline for the `spider-lib` framework.
//!
//! Upserts scraped product items into a search index, merging each new
//! sighting into the stored document: prices accumulate as a history, sizes
//! are added once, and quantity-only items update the matching size in place.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_pipeline_elasticsearch::config::ElasticsearchSettings;
//! use spider_pipeline_elasticsearch::elasticsearch_writer::ElasticsearchWriterPipeline;
//!
//! let settings = ElasticsearchSettings::new("products")
//!     .with_server("localhost", Some(9200))
//!     .with_unique_key("url");
//!
//! let crawler = CrawlerBuilder::new(MySpider)
//!     .add_pipeline(ElasticsearchWriterPipeline::new(settings)?)
//!     .build()
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod elasticsearch_writer;
pub mod error;
pub mod item;
pub mod key;
pub mod merge;
pub mod pipeline;

pub use client::{IndexClient, InMemoryIndex, UpsertRequest, WriteOutcome};
pub use config::{ElasticsearchSettings, LogLevel};
pub use elasticsearch_writer::{ElasticsearchWriterPipeline, WriteSummary};
pub use error::{IndexError, PipelineError};
pub use item::{ItemBatch, Record, ScrapedItem};
pub use key::{DocumentKey, KeyDigest};
pub use merge::{DocumentMerger, MergeOp, MergeScript, UpdatePayload, UpsertPayload};
pub use pipeline::Pipeline;
