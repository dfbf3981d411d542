//! Document merge logic.
//!
//! Every scraped record becomes one write against the index: the full
//! document to insert when nothing is stored under the record's key yet, and
//! a patch to apply when something is. The patch is a [`MergeScript`], an
//! ordered list of [`MergeOp`]s reading their inputs from a params map. Index
//! clients translate the ops into whatever partial-update mechanism their
//! backend offers; [`MergeScript::apply_to`] evaluates them locally with the
//! same semantics.
//!
//! Stored documents look like this:
//!
//! ```json
//! {
//!   "id": "X", "name": "...",            // descriptive fields, flattened
//!   "categories": [],
//!   "prices": [{"price": 10, "old_price": 12, "date": "..."}],
//!   "sizes":  [{"size": "M", "sales_notes": null, "sku": "A1", "barcode": null}]
//! }
//! ```
//!
//! `prices` only ever grows. `sizes` grows by at most one entry per update and
//! never holds two entries with the same `size`; the quantity update is the
//! only operation that rewrites an existing entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::config::ElasticsearchSettings;
use crate::error::{IndexError, PipelineError};
use crate::item::Record;
use crate::key::{compute_key, DocumentKey, KeyDigest};

/// Record fields that go into a price entry.
pub const PRICE_FIELDS: [&str; 2] = ["price", "old_price"];
/// Record fields that go into a size entry.
pub const SIZE_FIELDS: [&str; 4] = ["size", "sales_notes", "sku", "barcode"];

pub const PRICES: &str = "prices";
pub const SIZES: &str = "sizes";
pub const CATEGORIES: &str = "categories";

/// Named inputs of a [`MergeScript`].
pub type Params = Map<String, Value>;

fn is_history_field(field: &str) -> bool {
    PRICE_FIELDS.contains(&field) || SIZE_FIELDS.contains(&field)
}

/// One observation of a product's price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub price: Value,
    pub old_price: Value,
    pub date: DateTime<Utc>,
}

impl PriceEntry {
    fn from_record(record: &Record, date: DateTime<Utc>) -> Result<Self, PipelineError> {
        Ok(PriceEntry {
            price: record.require("price")?.clone(),
            old_price: record.require("old_price")?.clone(),
            date,
        })
    }

    /// Price entry for records that may carry no price at all, such as
    /// quantity adjustments. Absent fields become `null`.
    fn from_record_or_null(record: &Record, date: DateTime<Utc>) -> Self {
        PriceEntry {
            price: record.get_or_null("price"),
            old_price: record.get_or_null("old_price"),
            date,
        }
    }
}

/// One size variant of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeEntry {
    pub size: Value,
    pub sales_notes: Value,
    pub sku: Value,
    pub barcode: Value,
}

impl SizeEntry {
    fn from_record(record: &Record) -> Result<Self, PipelineError> {
        Ok(SizeEntry {
            size: record.require("size")?.clone(),
            sales_notes: record.get_or_null("sales_notes"),
            sku: record.get_or_null("sku"),
            barcode: record.get_or_null("barcode"),
        })
    }
}

/// Document inserted when no document exists under the key.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPayload {
    /// Every record field except the price and size fields.
    pub fields: Map<String, Value>,
    /// Filled by category enrichment, which is not implemented; always empty.
    pub categories: Vec<Value>,
    pub prices: Vec<PriceEntry>,
    pub sizes: Vec<SizeEntry>,
}

impl UpsertPayload {
    /// The document as stored in the index.
    pub fn to_document(&self) -> Result<Value, PipelineError> {
        let mut doc = self.fields.clone();
        doc.insert(CATEGORIES.to_string(), Value::Array(self.categories.clone()));
        doc.insert(PRICES.to_string(), serde_json::to_value(&self.prices)?);
        doc.insert(SIZES.to_string(), serde_json::to_value(&self.sizes)?);
        Ok(Value::Object(doc))
    }
}

/// What an update does to an existing document.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    /// Set the quantity of the stored size entry matching `size`.
    Quantity { quantity: Value, size: Value },
    /// Refresh descriptive fields, log a price and add the size if it is new.
    Append {
        fields: Map<String, Value>,
        price: PriceEntry,
        size: SizeEntry,
    },
}

impl UpdatePayload {
    /// Top-level fields this update writes.
    pub fn fields(&self) -> Map<String, Value> {
        match self {
            UpdatePayload::Quantity { .. } => Map::new(),
            UpdatePayload::Append { fields, .. } => fields.clone(),
        }
    }
}

/// A single step of a partial update. Param names refer to the [`Params`]
/// passed alongside the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MergeOp {
    /// Copy every entry of the object param to the top level of the document.
    SetFields { param: String },
    /// Push the param onto the array `field`, creating the array if needed.
    Append { field: String, param: String },
    /// Push the param onto the array `field` unless an element already has the
    /// same value under `key`. Elements are scanned in stored order and the
    /// scan stops at the first match.
    AppendUnlessPresent {
        field: String,
        param: String,
        key: String,
    },
    /// In the array `field`, find the first element whose `key` equals the
    /// `match_param` param and set its `set` member to the `value_param` param.
    /// Does nothing when no element matches.
    SetWhereMatch {
        field: String,
        key: String,
        match_param: String,
        set: String,
        value_param: String,
    },
}

/// Ordered list of [`MergeOp`]s applied atomically to one stored document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeScript {
    ops: Vec<MergeOp>,
}

impl MergeScript {
    pub fn new(ops: Vec<MergeOp>) -> Self {
        MergeScript { ops }
    }

    pub fn ops(&self) -> &[MergeOp] {
        &self.ops
    }

    /// Applies the script to `doc`, which must be a JSON object.
    pub fn apply_to(&self, doc: &mut Value, params: &Params) -> Result<(), IndexError> {
        let source = doc
            .as_object_mut()
            .ok_or_else(|| IndexError::Script("stored document is not an object".to_string()))?;
        for op in &self.ops {
            apply_op(op, source, params)?;
        }
        Ok(())
    }
}

fn param<'a>(params: &'a Params, name: &str) -> Result<&'a Value, IndexError> {
    params
        .get(name)
        .ok_or_else(|| IndexError::Script(format!("missing script param `{}`", name)))
}

fn array_mut<'a>(
    source: &'a mut Map<String, Value>,
    field: &str,
) -> Result<&'a mut Vec<Value>, IndexError> {
    let slot = source
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
        .ok_or_else(|| IndexError::Script(format!("field `{}` is not an array", field)))
}

fn apply_op(op: &MergeOp, source: &mut Map<String, Value>, params: &Params) -> Result<(), IndexError> {
    match op {
        MergeOp::SetFields { param: name } => {
            let fields = param(params, name)?
                .as_object()
                .ok_or_else(|| IndexError::Script(format!("param `{}` is not an object", name)))?;
            for (k, v) in fields {
                source.insert(k.clone(), v.clone());
            }
        }
        MergeOp::Append { field, param: name } => {
            let value = param(params, name)?.clone();
            array_mut(source, field)?.push(value);
        }
        MergeOp::AppendUnlessPresent {
            field,
            param: name,
            key,
        } => {
            let value = param(params, name)?;
            let wanted = value.get(key);
            let entries = array_mut(source, field)?;
            if entries.iter().any(|entry| entry.get(key) == wanted) {
                trace!("{}.{} already present, not appending", field, key);
            } else {
                entries.push(value.clone());
            }
        }
        MergeOp::SetWhereMatch {
            field,
            key,
            match_param,
            set,
            value_param,
        } => {
            let wanted = param(params, match_param)?;
            let new_value = param(params, value_param)?;
            let Some(entries) = source.get_mut(field).and_then(Value::as_array_mut) else {
                debug!("no `{}` array stored, nothing to update", field);
                return Ok(());
            };
            match entries
                .iter_mut()
                .find(|entry| entry.get(key) == Some(wanted))
                .and_then(Value::as_object_mut)
            {
                Some(entry) => {
                    entry.insert(set.clone(), new_value.clone());
                }
                // Unknown size: the update is dropped rather than inserting a new entry.
                None => debug!("no {} entry with {} = {}, update skipped", field, key, wanted),
            }
        }
    }
    Ok(())
}

/// Everything needed to patch an existing document.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pub payload: UpdatePayload,
    pub params: Params,
    pub script: MergeScript,
}

/// Key, fallback document and patch for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePlan {
    pub key: DocumentKey,
    pub upsert: UpsertPayload,
    pub update: UpdatePlan,
}

/// Turns records into index writes.
#[derive(Debug, Clone)]
pub struct DocumentMerger {
    unique_key: Option<String>,
    digest: KeyDigest,
    clock: fn() -> DateTime<Utc>,
}

impl DocumentMerger {
    pub fn new(unique_key: Option<String>, digest: KeyDigest) -> Self {
        DocumentMerger {
            unique_key,
            digest,
            clock: Utc::now,
        }
    }

    pub fn from_settings(settings: &ElasticsearchSettings) -> Self {
        Self::new(settings.unique_key.clone(), settings.key_digest)
    }

    /// Replaces the timestamp source used for price entries.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn unique_key(&self) -> Option<&str> {
        self.unique_key.as_deref()
    }

    pub fn compute_key(&self, record: &Record) -> Result<DocumentKey, PipelineError> {
        compute_key(record, self.unique_key.as_deref(), self.digest)
    }

    /// Builds the document inserted when the key is not yet in the index.
    pub fn build_upsert(&self, record: &Record) -> Result<UpsertPayload, PipelineError> {
        self.upsert_at(record, (self.clock)())
    }

    /// Builds the patch applied when the key is already in the index.
    pub fn build_update(&self, record: &Record) -> Result<UpdatePlan, PipelineError> {
        self.update_at(record, (self.clock)())
    }

    /// Key, upsert and update for `record`, sharing one timestamp.
    pub fn plan(&self, record: &Record) -> Result<WritePlan, PipelineError> {
        let key = self.compute_key(record)?;
        let now = (self.clock)();
        Ok(WritePlan {
            key,
            upsert: self.upsert_at(record, now)?,
            update: self.update_at(record, now)?,
        })
    }

    fn descriptive_fields(record: &Record) -> Map<String, Value> {
        record
            .iter()
            .filter(|(k, _)| !is_history_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn upsert_at(&self, record: &Record, now: DateTime<Utc>) -> Result<UpsertPayload, PipelineError> {
        Ok(UpsertPayload {
            fields: Self::descriptive_fields(record),
            categories: Vec::new(),
            prices: vec![if record.non_null("quantity").is_some() {
                PriceEntry::from_record_or_null(record, now)
            } else {
                PriceEntry::from_record(record, now)?
            }],
            sizes: vec![SizeEntry::from_record(record)?],
        })
    }

    fn update_at(&self, record: &Record, now: DateTime<Utc>) -> Result<UpdatePlan, PipelineError> {
        if let Some(quantity) = record.non_null("quantity") {
            let size = record.require("size")?.clone();

            let mut params = Params::new();
            params.insert("quantity".to_string(), quantity.clone());
            params.insert("size".to_string(), size.clone());

            let script = MergeScript::new(vec![MergeOp::SetWhereMatch {
                field: SIZES.to_string(),
                key: "size".to_string(),
                match_param: "size".to_string(),
                set: "quantity".to_string(),
                value_param: "quantity".to_string(),
            }]);

            return Ok(UpdatePlan {
                payload: UpdatePayload::Quantity {
                    quantity: quantity.clone(),
                    size,
                },
                params,
                script,
            });
        }

        let fields = Self::descriptive_fields(record);
        let price = PriceEntry::from_record(record, now)?;
        let size = SizeEntry::from_record(record)?;

        let mut params = Params::new();
        params.insert("fields".to_string(), Value::Object(fields.clone()));
        params.insert("price".to_string(), serde_json::to_value(&price)?);
        params.insert("size".to_string(), serde_json::to_value(&size)?);

        let script = MergeScript::new(vec![
            MergeOp::SetFields {
                param: "fields".to_string(),
            },
            MergeOp::Append {
                field: PRICES.to_string(),
                param: "price".to_string(),
            },
            MergeOp::AppendUnlessPresent {
                field: SIZES.to_string(),
                param: "size".to_string(),
                key: "size".to_string(),
            },
        ]);

        Ok(UpdatePlan {
            payload: UpdatePayload::Append {
                fields,
                price,
                size,
            },
            params,
            script,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn merger() -> DocumentMerger {
        DocumentMerger::new(None, KeyDigest::Sha1).with_clock(fixed_now)
    }

    fn record(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    fn product(size: &str) -> Record {
        record(json!({
            "id": "X",
            "name": "Runner",
            "price": 10,
            "old_price": 12,
            "size": size,
            "sales_notes": "in stock",
            "sku": "A1",
            "barcode": null,
        }))
    }

    fn stored(sizes: &[&str]) -> Value {
        let mut doc = merger().build_upsert(&product(sizes[0])).unwrap().to_document().unwrap();
        for size in &sizes[1..] {
            let plan = merger().build_update(&product(size)).unwrap();
            plan.script.apply_to(&mut doc, &plan.params).unwrap();
        }
        doc
    }

    fn len_of(doc: &Value, field: &str) -> usize {
        doc[field].as_array().map(Vec::len).unwrap_or(0)
    }

    #[test]
    fn upsert_moves_price_and_size_fields_into_history() {
        let doc = merger().build_upsert(&product("M")).unwrap().to_document().unwrap();
        assert_eq!(
            doc,
            json!({
                "id": "X",
                "name": "Runner",
                "categories": [],
                "prices": [{"price": 10, "old_price": 12, "date": "2024-03-01T12:00:00Z"}],
                "sizes": [{"size": "M", "sales_notes": "in stock", "sku": "A1", "barcode": null}],
            })
        );
    }

    #[test]
    fn upsert_keeps_quantity_at_top_level() {
        let mut r = product("M").into_inner();
        r.insert("quantity".to_string(), json!(3));
        let upsert = merger().build_upsert(&Record::new(r)).unwrap();
        assert_eq!(upsert.fields.get("quantity"), Some(&json!(3)));
    }

    #[test]
    fn upsert_defaults_absent_size_details_to_null() {
        let r = record(json!({
            "id": "X",
            "price": 10,
            "old_price": 12,
            "size": "M",
            "sku": "A1",
            "quantity": null,
        }));
        let doc = merger().build_upsert(&r).unwrap().to_document().unwrap();
        assert_eq!(
            doc,
            json!({
                "id": "X",
                "quantity": null,
                "categories": [],
                "prices": [{"price": 10, "old_price": 12, "date": "2024-03-01T12:00:00Z"}],
                "sizes": [{"size": "M", "sales_notes": null, "sku": "A1", "barcode": null}],
            })
        );
    }

    #[test]
    fn upsert_requires_price_and_size() {
        let no_size = record(json!({"id": "X", "price": 10, "old_price": 12}));
        match merger().build_upsert(&no_size) {
            Err(PipelineError::MissingField(field)) => assert_eq!(field, "size"),
            other => panic!("expected missing field, got {:?}", other),
        }

        let no_price = record(json!({"id": "X", "old_price": 12, "size": "M"}));
        match merger().build_upsert(&no_price) {
            Err(PipelineError::MissingField(field)) => assert_eq!(field, "price"),
            other => panic!("expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn quantity_record_without_price_still_plans() {
        let r = record(json!({"id": "X", "size": "M", "quantity": 5}));
        let plan = merger().plan(&r).unwrap();

        assert_eq!(plan.key.as_str(), "X");
        assert_eq!(plan.upsert.prices[0].price, Value::Null);
        assert_eq!(plan.upsert.prices[0].old_price, Value::Null);
        assert_eq!(plan.upsert.sizes[0].size, json!("M"));
        assert!(matches!(plan.update.payload, UpdatePayload::Quantity { .. }));
    }

    #[test]
    fn new_size_appends_one_price_and_one_size() {
        let mut doc = stored(&["M"]);
        let plan = merger().build_update(&product("L")).unwrap();
        plan.script.apply_to(&mut doc, &plan.params).unwrap();

        assert_eq!(len_of(&doc, PRICES), 2);
        assert_eq!(len_of(&doc, SIZES), 2);
        assert_eq!(doc[SIZES][1]["size"], json!("L"));
    }

    #[test]
    fn known_size_appends_price_only() {
        let mut doc = stored(&["M", "L"]);
        let plan = merger().build_update(&product("M")).unwrap();
        plan.script.apply_to(&mut doc, &plan.params).unwrap();

        assert_eq!(len_of(&doc, PRICES), 3);
        assert_eq!(len_of(&doc, SIZES), 2);
    }

    #[test]
    fn append_update_refreshes_descriptive_fields() {
        let mut doc = stored(&["M"]);
        let mut r = product("M").into_inner();
        r.insert("name".to_string(), json!("Runner v2"));
        let plan = merger().build_update(&Record::new(r)).unwrap();
        plan.script.apply_to(&mut doc, &plan.params).unwrap();

        assert_eq!(doc["name"], json!("Runner v2"));
        assert!(doc.get("price").is_none());
    }

    #[test]
    fn quantity_updates_matching_size_in_place() {
        let mut doc = stored(&["S", "M"]);
        let before = doc.clone();

        let r = record(json!({"id": "X", "size": "M", "quantity": 5}));
        let plan = merger().build_update(&r).unwrap();
        assert_eq!(
            plan.payload,
            UpdatePayload::Quantity {
                quantity: json!(5),
                size: json!("M")
            }
        );
        assert!(plan.payload.fields().is_empty());

        plan.script.apply_to(&mut doc, &plan.params).unwrap();

        assert_eq!(doc[SIZES][1]["quantity"], json!(5));
        assert_eq!(doc[SIZES][0], before[SIZES][0]);
        assert_eq!(doc[PRICES], before[PRICES]);
        assert_eq!(doc["name"], before["name"]);
    }

    #[test]
    fn quantity_for_unknown_size_is_a_noop() {
        let mut doc = stored(&["S", "M"]);
        let before = doc.clone();

        let plan = merger()
            .build_update(&record(json!({"id": "X", "size": "XXL", "quantity": 1})))
            .unwrap();
        plan.script.apply_to(&mut doc, &plan.params).unwrap();

        assert_eq!(doc, before);
    }

    #[test]
    fn zero_quantity_takes_the_quantity_branch_and_null_does_not() {
        let zero = merger()
            .build_update(&record(json!({"id": "X", "size": "M", "quantity": 0})))
            .unwrap();
        assert!(matches!(zero.payload, UpdatePayload::Quantity { .. }));

        let mut r = product("M").into_inner();
        r.insert("quantity".to_string(), Value::Null);
        let null = merger().build_update(&Record::new(r)).unwrap();
        assert!(matches!(null.payload, UpdatePayload::Append { .. }));
    }

    #[test]
    fn append_creates_missing_arrays() {
        let mut doc = json!({"id": "X"});
        let plan = merger().build_update(&product("M")).unwrap();
        plan.script.apply_to(&mut doc, &plan.params).unwrap();
        assert_eq!(len_of(&doc, PRICES), 1);
        assert_eq!(len_of(&doc, SIZES), 1);
    }

    #[test]
    fn plan_shares_one_timestamp() {
        let plan = merger().plan(&product("M")).unwrap();
        assert_eq!(plan.key.as_str(), "X");
        assert_eq!(plan.upsert.prices[0].date, fixed_now());
        assert_eq!(plan.update.params["price"]["date"], json!("2024-03-01T12:00:00Z"));
    }

    #[test]
    fn script_serializes_as_tagged_ops() {
        let plan = merger().build_update(&product("M")).unwrap();
        let encoded = serde_json::to_value(&plan.script).unwrap();
        assert_eq!(encoded[0], json!({"op": "set_fields", "param": "fields"}));
        assert_eq!(encoded[2]["op"], json!("append_unless_present"));
    }
}
