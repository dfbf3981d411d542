//! Item Pipeline for upserting scraped items into a search index.
//!
//! This module provides the `ElasticsearchWriterPipeline`. For every item it
//! computes the document key, builds the document to insert when the key is
//! new and the patch to apply when it is not, and sends both in a single
//! scripted upsert. Repeated sightings of a product therefore accumulate a
//! price history and a deduplicated list of sizes on one document.
//!
//! Failures never leave the pipeline: a bad item or an unreachable index is
//! logged and the item is still passed on, so the rest of the crawl goes on.

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use tracing::{debug, info};

use crate::client::{IndexClient, UpsertRequest, WriteOutcome};
use crate::config::{log_at, ElasticsearchSettings};
use crate::error::PipelineError;
use crate::item::{ItemBatch, Record, ScrapedItem};
use crate::merge::DocumentMerger;
use crate::pipeline::Pipeline;

#[cfg(feature = "elasticsearch")]
use crate::client::ElasticsearchClient;

/// Per-outcome counts for a batch or stream of items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl WriteSummary {
    fn record(&mut self, result: Option<WriteOutcome>) {
        match result {
            Some(WriteOutcome::Created) => self.created += 1,
            Some(WriteOutcome::Updated) => self.updated += 1,
            Some(WriteOutcome::Noop) => self.unchanged += 1,
            None => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.failed
    }
}

/// A pipeline that merges scraped items into documents of a search index.
pub struct ElasticsearchWriterPipeline<C> {
    settings: ElasticsearchSettings,
    merger: DocumentMerger,
    client: C,
}

#[cfg(feature = "elasticsearch")]
impl ElasticsearchWriterPipeline<ElasticsearchClient> {
    /// Creates a pipeline writing to the Elasticsearch server named in `settings`.
    pub fn new(settings: ElasticsearchSettings) -> Result<Self, PipelineError> {
        let client = ElasticsearchClient::new(&settings)?;
        Ok(Self::with_client(settings, client))
    }

    /// Creates a pipeline from `ELASTICSEARCH_*` environment variables.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::new(ElasticsearchSettings::from_env()?)
    }
}

impl<C: IndexClient> ElasticsearchWriterPipeline<C> {
    /// Creates a pipeline writing through an arbitrary index client.
    pub fn with_client(settings: ElasticsearchSettings, client: C) -> Self {
        info!(
            "Initializing ElasticsearchWriterPipeline for index: {} ({} backend)",
            settings.index,
            client.backend_name()
        );
        let merger = DocumentMerger::from_settings(&settings);
        ElasticsearchWriterPipeline {
            settings,
            merger,
            client,
        }
    }

    /// Replaces the merger, e.g. to pin the timestamp source.
    pub fn with_merger(mut self, merger: DocumentMerger) -> Self {
        self.merger = merger;
        self
    }

    pub fn settings(&self) -> &ElasticsearchSettings {
        &self.settings
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Writes one record: patch the stored document, or create it.
    pub async fn apply(&self, record: &Record) -> Result<WriteOutcome, PipelineError> {
        let plan = self.merger.plan(record)?;
        if self.merger.unique_key().is_some() {
            log_at!(self.settings.log_level, key = %plan.key, "Generated unique key");
        }

        let request = UpsertRequest {
            index: self.settings.index.clone(),
            doc_type: self.settings.doc_type.clone(),
            key: plan.key,
            script: plan.update.script,
            params: plan.update.params,
            upsert: plan.upsert.to_document()?,
        };

        let outcome = self
            .client
            .upsert_with_patch(&request)
            .await
            .map_err(|source| PipelineError::ExternalService {
                index: self.settings.index.clone(),
                source,
            })?;

        if outcome.is_new() {
            // TODO: fill `categories` once a category enrichment source exists.
            debug!(key = %request.key, "New document created; category enrichment not configured");
        }
        Ok(outcome)
    }

    /// Converts an item to a record and writes it.
    pub async fn index_item<I: ScrapedItem>(&self, item: &I) -> Result<WriteOutcome, PipelineError> {
        let record = Record::from_item(item)?;
        self.apply(&record).await
    }

    /// Writes one item and logs the outcome. Errors stop here.
    async fn index_and_log<I: ScrapedItem>(&self, item: &I) -> Option<WriteOutcome> {
        let index = self.settings.index.as_str();
        match self.index_item(item).await {
            Ok(outcome) => {
                log_at!(
                    self.settings.log_level,
                    index,
                    ?outcome,
                    "Item sent to Elasticsearch {}",
                    index
                );
                Some(outcome)
            }
            Err(e) => {
                log_at!(
                    self.settings.log_level,
                    index,
                    error = %e,
                    "Error sending item to Elasticsearch {}",
                    index
                );
                None
            }
        }
    }

    /// Writes one item, or each element when its JSON form is an array, and
    /// counts the outcomes into `summary`.
    async fn write_item<I: ScrapedItem>(&self, item: &I, summary: &mut WriteSummary) {
        match ItemBatch::from_json(item.to_json_value()) {
            ItemBatch::Single(_) => summary.record(self.index_and_log(item).await),
            sequence => {
                let leaves = sequence.into_items();
                debug!("Item is a sequence of {} records", leaves.len());
                for leaf in &leaves {
                    summary.record(self.index_and_log(leaf).await);
                }
            }
        }
    }

    /// Writes every item of `batch` in delivery order, each on its own.
    ///
    /// A failing item is logged and skipped; the batch comes back with the
    /// same shape for the next pipeline stage.
    pub fn process_batch<'a, I: ScrapedItem>(
        &'a self,
        batch: ItemBatch<I>,
    ) -> BoxFuture<'a, ItemBatch<I>> {
        async move {
            match batch {
                ItemBatch::Single(item) => {
                    self.write_item(&item, &mut WriteSummary::default()).await;
                    ItemBatch::Single(item)
                }
                ItemBatch::Sequence(children) => {
                    let mut processed = Vec::with_capacity(children.len());
                    for child in children {
                        processed.push(self.process_batch(child).await);
                    }
                    ItemBatch::Sequence(processed)
                }
            }
        }
        .boxed()
    }

    /// Pulls items from `stream` one at a time and writes each.
    pub async fn process_stream<I, S>(&self, stream: S) -> WriteSummary
    where
        I: ScrapedItem,
        S: Stream<Item = I> + Send,
    {
        let mut stream = Box::pin(stream);
        let mut summary = WriteSummary::default();
        while let Some(item) = stream.next().await {
            self.write_item(&item, &mut summary).await;
        }
        debug!(?summary, "Finished processing item stream");
        summary
    }
}

#[async_trait::async_trait]
impl<I: ScrapedItem, C: IndexClient + 'static> Pipeline<I> for ElasticsearchWriterPipeline<C> {
    fn name(&self) -> &str {
        "ElasticsearchWriterPipeline"
    }

    async fn process_item(&self, item: I) -> Result<Option<I>, PipelineError> {
        debug!("ElasticsearchWriterPipeline processing item.");
        self.write_item(&item, &mut WriteSummary::default()).await;
        Ok(Some(item))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        info!(
            "ElasticsearchWriterPipeline for index {} closed.",
            self.settings.index
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryIndex;
    use crate::key::KeyDigest;
    use serde_json::json;
    use std::sync::Arc;

    fn pipeline(settings: ElasticsearchSettings) -> (ElasticsearchWriterPipeline<Arc<InMemoryIndex>>, Arc<InMemoryIndex>) {
        let index = Arc::new(InMemoryIndex::new());
        (
            ElasticsearchWriterPipeline::with_client(settings, Arc::clone(&index)),
            index,
        )
    }

    #[tokio::test]
    async fn apply_creates_then_updates() {
        let (pipeline, index) = pipeline(ElasticsearchSettings::new("shop"));
        let item = json!({
            "id": "X", "price": 10, "old_price": 12, "size": "M",
            "sales_notes": null, "sku": "A1", "barcode": null
        });

        assert_eq!(pipeline.index_item(&item).await.unwrap(), WriteOutcome::Created);
        assert_eq!(pipeline.index_item(&item).await.unwrap(), WriteOutcome::Updated);

        let doc = index.get("shop", "X").await.unwrap();
        assert_eq!(doc["prices"].as_array().unwrap().len(), 2);
        assert_eq!(doc["sizes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unique_key_digests_the_configured_field() {
        let settings = ElasticsearchSettings::new("shop")
            .with_unique_key("url")
            .with_key_digest(KeyDigest::Sha1);
        let (pipeline, index) = pipeline(settings);
        let item = json!({
            "url": "abc", "price": 1, "old_price": null, "size": "S",
            "sales_notes": null, "sku": null, "barcode": null
        });

        pipeline.index_item(&item).await.unwrap();
        assert!(index
            .get("shop", "a9993e364706816aba3e25717850c26c9cd0d89d")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn process_item_passes_failures_through() {
        let (pipeline, index) = pipeline(ElasticsearchSettings::new("shop"));
        let broken = json!({"id": "X", "price": 10});

        let returned = Pipeline::process_item(&pipeline, broken.clone()).await.unwrap();
        assert_eq!(returned, Some(broken));
        assert!(index.is_empty().await);
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = WriteSummary::default();
        summary.record(Some(WriteOutcome::Created));
        summary.record(Some(WriteOutcome::Noop));
        summary.record(None);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 3);
    }
}
