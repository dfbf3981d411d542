//! Trait for item processing pipelines.
//!
//! The crawler hands every item a spider yields to each configured pipeline in
//! turn. A pipeline can store the item, transform it, or drop it, and must
//! hand back whatever the next stage should see.

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::item::ScrapedItem;

/// The `Pipeline` trait defines the contract for item processing pipelines.
#[async_trait]
pub trait Pipeline<I: ScrapedItem>: Send + Sync + 'static {
    /// Returns the name of the pipeline.
    fn name(&self) -> &str;

    /// Processes a single scraped item.
    ///
    /// Returning `Ok(Some(item))` passes the item to the next stage, `Ok(None)`
    /// drops it. An `Err` is reported by the crawler against this item only.
    async fn process_item(&self, item: I) -> Result<Option<I>, PipelineError>;

    /// Called when the spider is closing.
    async fn close(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}
