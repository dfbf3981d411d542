//! Items handed to the pipeline by the crawler.
//!
//! A spider produces values implementing [`ScrapedItem`]. The Elasticsearch
//! writer only ever looks at an item through its JSON object form, wrapped in
//! a [`Record`]. Crawlers that yield several items at once wrap them in an
//! [`ItemBatch`], which the writer walks explicitly. An item whose JSON form
//! is an array is split the same way with [`ItemBatch::from_json`].

use std::fmt::Debug;

use serde_json::{Map, Value};

use crate::error::PipelineError;

/// A scraped entity that can be flattened into a JSON value.
pub trait ScrapedItem: Debug + Send + Sync + 'static {
    /// Returns the item as JSON. Pipelines that store items expect an object.
    fn to_json_value(&self) -> Value;
}

impl ScrapedItem for Value {
    fn to_json_value(&self) -> Value {
        self.clone()
    }
}

/// Field name → value view of a single scraped item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Record { fields }
    }

    /// Converts any scraped item into a record. Fails unless the item is a JSON object.
    pub fn from_item<I: ScrapedItem>(item: &I) -> Result<Self, PipelineError> {
        Record::try_from(item.to_json_value())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns the field's value, failing with [`PipelineError::MissingField`] when
    /// the item does not carry it at all. A present `null` is returned as-is.
    pub fn require(&self, field: &str) -> Result<&Value, PipelineError> {
        self.fields
            .get(field)
            .ok_or_else(|| PipelineError::missing(field))
    }

    /// Returns a copy of the field's value, `null` when absent.
    pub fn get_or_null(&self, field: &str) -> Value {
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    /// Returns the field's value only if it is present and not `null`.
    pub fn non_null(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.fields
    }
}

impl TryFrom<Value> for Record {
    type Error = PipelineError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Record { fields }),
            other => Err(PipelineError::ItemError(format!(
                "Item for indexing must be a JSON object, got: {}",
                other
            ))),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Record {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl ScrapedItem for Record {
    fn to_json_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// One item or a (possibly nested) sequence of items delivered in a single call.
#[derive(Debug)]
pub enum ItemBatch<I> {
    Single(I),
    Sequence(Vec<ItemBatch<I>>),
}

impl<I> ItemBatch<I> {
    /// Number of leaf items in the batch.
    pub fn item_count(&self) -> usize {
        match self {
            ItemBatch::Single(_) => 1,
            ItemBatch::Sequence(children) => children.iter().map(ItemBatch::item_count).sum(),
        }
    }

    /// Flattens the batch in delivery order.
    pub fn into_items(self) -> Vec<I> {
        let mut out = Vec::with_capacity(self.item_count());
        self.collect_into(&mut out);
        out
    }

    fn collect_into(self, out: &mut Vec<I>) {
        match self {
            ItemBatch::Single(item) => out.push(item),
            ItemBatch::Sequence(children) => {
                for child in children {
                    child.collect_into(out);
                }
            }
        }
    }
}

impl ItemBatch<Value> {
    /// Splits a JSON item by shape: an array (nested ones included) becomes a
    /// sequence of its elements, anything else a single item.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Array(values) => {
                ItemBatch::Sequence(values.into_iter().map(ItemBatch::from_json).collect())
            }
            other => ItemBatch::Single(other),
        }
    }
}

impl<I> From<I> for ItemBatch<I> {
    fn from(item: I) -> Self {
        ItemBatch::Single(item)
    }
}

impl<I> FromIterator<I> for ItemBatch<I> {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        ItemBatch::Sequence(iter.into_iter().map(ItemBatch::Single).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_from_non_object_is_rejected() {
        let err = Record::from_item(&json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, PipelineError::ItemError(_)));
    }

    #[test]
    fn require_distinguishes_absent_from_null() {
        let record = Record::from_item(&json!({"old_price": null})).unwrap();
        assert_eq!(record.require("old_price").unwrap(), &Value::Null);
        assert!(record.non_null("old_price").is_none());
        match record.require("price") {
            Err(PipelineError::MissingField(field)) => assert_eq!(field, "price"),
            other => panic!("expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn nested_batch_flattens_in_order() {
        let batch = ItemBatch::Sequence(vec![
            ItemBatch::Single(1),
            ItemBatch::Sequence(vec![ItemBatch::Single(2), ItemBatch::Single(3)]),
            ItemBatch::Sequence(vec![]),
            ItemBatch::Single(4),
        ]);
        assert_eq!(batch.item_count(), 4);
        assert_eq!(batch.into_items(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn json_arrays_split_into_their_elements() {
        let batch = ItemBatch::from_json(json!([{"id": "A"}, [{"id": "B"}, "bad"], []]));
        assert_eq!(batch.item_count(), 3);
        assert_eq!(
            batch.into_items(),
            vec![json!({"id": "A"}), json!({"id": "B"}), json!("bad")]
        );

        let single = ItemBatch::from_json(json!({"id": "A"}));
        assert!(matches!(single, ItemBatch::Single(_)));
    }
}
