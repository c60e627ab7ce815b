mod memory;
mod mongo;
pub mod pipeline;

pub use memory::MemoryStore;
pub use mongo::{MongoStore, ServerOverview, StoreConfig};
pub use pipeline::{
    Accumulator, Expr, FindQuery, Filter, Group, Pipeline, Projection, SortOrder, Stage,
};

use crate::error::{StoreError, StoreResult};
use crate::reading::SensorReading;
use async_trait::async_trait;
use mongodb::bson::{self, Bson, Document};
use std::collections::BTreeMap;

pub const DEFAULT_DATABASE: &str = "iot_data";
pub const DEFAULT_COLLECTION: &str = "sensor_readings";

/// Handle to the reading collection.
///
/// Implementations own one long-lived session and are cheap to clone; clones share it.
/// They never retry and never cache: every call is a round trip and every failure is
/// reported through [`StoreError`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Appends one document and returns the identity the store assigned.
    async fn insert_one(&self, document: Document) -> StoreResult<String>;

    async fn find(&self, query: &FindQuery) -> StoreResult<Vec<Document>>;

    async fn aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Document>>;

    async fn count(&self, filter: &Filter) -> StoreResult<u64>;

    async fn insert_reading(&self, reading: &SensorReading) -> StoreResult<String> {
        let document = encode_reading(reading)?;
        self.insert_one(document).await
    }

    /// Newest documents first, at most `limit` of them.
    async fn find_recent(&self, limit: u32) -> StoreResult<Vec<Document>> {
        if limit == 0 {
            return Err(StoreError::query("find_recent", "limit must be >= 1"));
        }
        self.find(&FindQuery::all().newest_first().limit(i64::from(limit)))
            .await
    }

    /// Number of documents per distinct value of `key`. Documents missing the field are
    /// counted under `"null"`.
    async fn count_by(&self, key: &str) -> StoreResult<BTreeMap<String, u64>> {
        let pipeline = Pipeline::new().group(Group::by(Expr::field(key)).count("count"));
        let rows = self.aggregate(&pipeline).await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let group = row.get("_id").map(bson_key).unwrap_or_else(|| "null".to_string());
            let count = row.get("count").and_then(bson_u64).ok_or_else(|| {
                StoreError::query("count_by", format!("group {group:?} has no numeric count"))
            })?;
            *counts.entry(group).or_insert(0) += count;
        }
        Ok(counts)
    }
}

pub fn encode_reading(reading: &SensorReading) -> StoreResult<Document> {
    bson::to_document(reading).map_err(|err| StoreError::write("encode", err.to_string()))
}

pub fn decode_reading(document: Document) -> StoreResult<SensorReading> {
    bson::from_document(document).map_err(|err| StoreError::query("decode", err.to_string()))
}

pub(crate) fn bson_key(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Null | Bson::Undefined => "null".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn bson_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

pub(crate) fn bson_u64(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(v) => u64::try_from(*v).ok(),
        Bson::Int64(v) => u64::try_from(*v).ok(),
        Bson::Double(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as u64),
        _ => None,
    }
}
