use super::pipeline::{Accumulator, Expr, Filter, FindQuery, Group, Pipeline, SortOrder, Stage};
use super::{bson_f64, DocumentStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use mongodb::bson::{oid::ObjectId, Bson, Document};
use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

/// In-process document store that interprets [`Pipeline`] values directly.
///
/// Used for offline runs (`--memory`) and as the engine behind store-level tests. Clones
/// share the same collection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    documents: Arc<RwLock<Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, operation: &'static str) -> StoreResult<Vec<Document>> {
        self.documents
            .read()
            .map(|docs| docs.clone())
            .map_err(|_| StoreError::connection(operation, "collection lock poisoned"))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, mut document: Document) -> StoreResult<String> {
        let id = match document.get("_id") {
            Some(Bson::ObjectId(id)) => *id,
            Some(_) => {
                return Err(StoreError::write(
                    "insert_one",
                    "_id must be an ObjectId when supplied",
                ))
            }
            None => {
                let id = ObjectId::new();
                document.insert("_id", id);
                id
            }
        };
        let mut docs = self
            .documents
            .write()
            .map_err(|_| StoreError::connection("insert_one", "collection lock poisoned"))?;
        let duplicate = docs
            .iter()
            .any(|existing| matches!(existing.get("_id"), Some(Bson::ObjectId(other)) if *other == id));
        if duplicate {
            return Err(StoreError::write(
                "insert_one",
                format!("duplicate key _id {id}"),
            ));
        }
        docs.push(document);
        Ok(id.to_hex())
    }

    async fn find(&self, query: &FindQuery) -> StoreResult<Vec<Document>> {
        query.validate()?;
        let mut docs: Vec<Document> = self
            .snapshot("find")?
            .into_iter()
            .filter(|doc| matches_filter(&query.filter, doc))
            .collect();
        if let Some((field, order)) = &query.sort {
            sort_documents(&mut docs, &[(field.clone(), *order)]);
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit as usize);
        }
        Ok(docs)
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Document>> {
        pipeline.validate()?;
        let mut docs = self.snapshot("aggregate")?;
        for stage in pipeline.stages() {
            docs = match stage {
                Stage::Match(filter) => docs
                    .into_iter()
                    .filter(|doc| matches_filter(filter, doc))
                    .collect(),
                Stage::Project(projection) => docs
                    .iter()
                    .map(|doc| {
                        let mut out = Document::new();
                        if let Some(id) = doc.get("_id") {
                            out.insert("_id", id.clone());
                        }
                        for (name, expr) in &projection.fields {
                            out.insert(name.clone(), evaluate(expr, doc));
                        }
                        out
                    })
                    .collect(),
                Stage::Group(group) => run_group(group, &docs),
                Stage::Sort(keys) => {
                    sort_documents(&mut docs, keys);
                    docs
                }
                Stage::Limit(limit) => {
                    docs.truncate(*limit as usize);
                    docs
                }
            };
        }
        Ok(docs)
    }

    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        filter.validate()?;
        Ok(self
            .snapshot("count")?
            .iter()
            .filter(|doc| matches_filter(filter, doc))
            .count() as u64)
    }
}

fn field_value(doc: &Document, field: &str) -> Bson {
    doc.get(field).cloned().unwrap_or(Bson::Null)
}

fn evaluate(expr: &Expr, doc: &Document) -> Bson {
    match expr {
        Expr::Field(name) => field_value(doc, name),
        Expr::CelsiusTemperature => {
            let Some(temperature) = doc.get("temperature").and_then(bson_f64) else {
                return Bson::Null;
            };
            match doc.get("unit") {
                Some(Bson::String(unit)) if unit == "F" => {
                    Bson::Double((temperature - 32.0) * 5.0 / 9.0)
                }
                _ => Bson::Double(temperature),
            }
        }
        Expr::HourOf(name) => match doc.get(name) {
            Some(Bson::String(raw)) => raw
                .get(..13)
                .map(|hour| Bson::String(hour.to_string()))
                .unwrap_or(Bson::Null),
            _ => Bson::Null,
        },
        Expr::Compound(parts) => {
            let mut out = Document::new();
            for (name, part) in parts {
                out.insert(name.clone(), evaluate(part, doc));
            }
            Bson::Document(out)
        }
        Expr::Literal(value) => value.clone(),
    }
}

fn matches_filter(filter: &Filter, doc: &Document) -> bool {
    match filter {
        Filter::All => true,
        Filter::Eq(field, value) => {
            let actual = field_value(doc, field);
            same_class(&actual, value) && compare_bson(&actual, value) == Ordering::Equal
        }
        Filter::Gte(field, value) => {
            let actual = field_value(doc, field);
            same_class(&actual, value) && compare_bson(&actual, value) != Ordering::Less
        }
        Filter::Lt(field, value) => {
            let actual = field_value(doc, field);
            same_class(&actual, value) && compare_bson(&actual, value) == Ordering::Less
        }
        Filter::And(parts) => parts.iter().all(|part| matches_filter(part, doc)),
    }
}

fn type_class(value: &Bson) -> u8 {
    match value {
        Bson::Null | Bson::Undefined => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 1,
        Bson::String(_) => 2,
        _ => 3,
    }
}

fn same_class(a: &Bson, b: &Bson) -> bool {
    type_class(a) == type_class(b)
}

fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(x), Some(y)) = (bson_f64(a), bson_f64(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    type_class(a)
        .cmp(&type_class(b))
        .then_with(|| match (a, b) {
            (Bson::String(x), Bson::String(y)) => x.cmp(y),
            _ if a == b => Ordering::Equal,
            _ => a.to_string().cmp(&b.to_string()),
        })
}

fn sort_documents(docs: &mut [Document], keys: &[(String, SortOrder)]) {
    docs.sort_by(|left, right| {
        for (field, order) in keys {
            let ordering = compare_bson(&field_value(left, field), &field_value(right, field));
            let ordering = match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

enum AccState {
    Count(i64),
    Sum(f64),
    Avg { total: f64, samples: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
}

impl AccState {
    fn new(accumulator: &Accumulator) -> Self {
        match accumulator {
            Accumulator::Count => AccState::Count(0),
            Accumulator::Sum(_) => AccState::Sum(0.0),
            Accumulator::Avg(_) => AccState::Avg {
                total: 0.0,
                samples: 0,
            },
            Accumulator::Min(_) => AccState::Min(None),
            Accumulator::Max(_) => AccState::Max(None),
            Accumulator::First(_) => AccState::First(None),
        }
    }

    fn consume(&mut self, accumulator: &Accumulator, doc: &Document) {
        let value = match accumulator {
            Accumulator::Count => Bson::Null,
            Accumulator::Sum(expr)
            | Accumulator::Avg(expr)
            | Accumulator::Min(expr)
            | Accumulator::Max(expr)
            | Accumulator::First(expr) => evaluate(expr, doc),
        };
        match self {
            AccState::Count(n) => *n += 1,
            AccState::Sum(total) => {
                if let Some(v) = bson_f64(&value) {
                    *total += v;
                }
            }
            AccState::Avg { total, samples } => {
                if let Some(v) = bson_f64(&value) {
                    *total += v;
                    *samples += 1;
                }
            }
            AccState::Min(current) => {
                if type_class(&value) == 0 {
                    return;
                }
                let replace = current
                    .as_ref()
                    .map(|c| compare_bson(&value, c) == Ordering::Less)
                    .unwrap_or(true);
                if replace {
                    *current = Some(value);
                }
            }
            AccState::Max(current) => {
                if type_class(&value) == 0 {
                    return;
                }
                let replace = current
                    .as_ref()
                    .map(|c| compare_bson(&value, c) == Ordering::Greater)
                    .unwrap_or(true);
                if replace {
                    *current = Some(value);
                }
            }
            AccState::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
        }
    }

    fn finish(self) -> Bson {
        match self {
            AccState::Count(n) => Bson::Int64(n),
            AccState::Sum(total) => Bson::Double(total),
            AccState::Avg { total, samples } => {
                if samples == 0 {
                    Bson::Null
                } else {
                    Bson::Double(total / samples as f64)
                }
            }
            AccState::Min(value) | AccState::Max(value) | AccState::First(value) => {
                value.unwrap_or(Bson::Null)
            }
        }
    }
}

fn run_group(group: &Group, docs: &[Document]) -> Vec<Document> {
    let mut groups: Vec<(Bson, Vec<AccState>)> = Vec::new();
    for doc in docs {
        let key = evaluate(&group.key, doc);
        let index = match groups.iter().position(|(existing, _)| *existing == key) {
            Some(index) => index,
            None => {
                let states = group
                    .outputs
                    .iter()
                    .map(|(_, accumulator)| AccState::new(accumulator))
                    .collect();
                groups.push((key, states));
                groups.len() - 1
            }
        };
        let states = &mut groups[index].1;
        for (state, (_, accumulator)) in states.iter_mut().zip(&group.outputs) {
            state.consume(accumulator, doc);
        }
    }

    groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for (state, (name, _)) in states.into_iter().zip(&group.outputs) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Projection;
    use mongodb::bson::doc;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let docs = [
            doc! { "type": "interior", "unit": "C", "temperature": 20.0, "device_id": "a", "timestamp": "2026-10-17T10:05:00.000000+00:00" },
            doc! { "type": "interior", "unit": "C", "temperature": 24.0, "device_id": "b", "timestamp": "2026-10-17T10:50:00.000000+00:00" },
            doc! { "type": "exterior", "unit": "F", "temperature": 212.0, "device_id": "a", "timestamp": "2026-10-17T11:10:00.000000+00:00" },
            doc! { "type": "exterior", "unit": "F", "temperature": 32.0, "device_id": "c", "timestamp": "2026-10-17T09:59:59.999999+00:00" },
        ];
        for doc in docs {
            store.insert_one(doc).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn find_sorts_newest_first_and_limits() {
        let store = seeded().await;
        let docs = store.find_recent(2).await.unwrap();
        let stamps: Vec<&str> = docs.iter().map(|d| d.get_str("timestamp").unwrap()).collect();
        assert_eq!(
            stamps,
            ["2026-10-17T11:10:00.000000+00:00", "2026-10-17T10:50:00.000000+00:00"]
        );
        assert!(store.find_recent(0).await.is_err());
    }

    #[tokio::test]
    async fn projection_normalizes_before_grouping() {
        let store = seeded().await;
        let pipeline = Pipeline::new()
            .project(
                Projection::new()
                    .field("type", Expr::field("type"))
                    .field("temperature_c", Expr::CelsiusTemperature),
            )
            .group(
                Group::by(Expr::field("type"))
                    .avg("avg", Expr::field("temperature_c"))
                    .min("min", Expr::field("temperature_c"))
                    .max("max", Expr::field("temperature_c")),
            )
            .sort_by("_id", SortOrder::Ascending);
        let rows = store.aggregate(&pipeline).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_str("_id").unwrap(), "exterior");
        assert_eq!(rows[0].get_f64("avg").unwrap(), 50.0);
        assert_eq!(rows[0].get_f64("min").unwrap(), 0.0);
        assert_eq!(rows[0].get_f64("max").unwrap(), 100.0);
        assert_eq!(rows[1].get_f64("avg").unwrap(), 22.0);
    }

    #[tokio::test]
    async fn hour_buckets_group_on_truncated_timestamp() {
        let store = seeded().await;
        let pipeline = Pipeline::new()
            .filter(Filter::gte("timestamp", "2026-10-17T10"))
            .group(Group::by(Expr::HourOf("timestamp".to_string())).count("n"))
            .sort_by("_id", SortOrder::Ascending);
        let rows = store.aggregate(&pipeline).await.unwrap();
        let buckets: Vec<(String, i64)> = rows
            .iter()
            .map(|r| (r.get_str("_id").unwrap().to_string(), r.get_i64("n").unwrap()))
            .collect();
        assert_eq!(
            buckets,
            [
                ("2026-10-17T10".to_string(), 2),
                ("2026-10-17T11".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn compound_keys_group_on_every_part() {
        let store = seeded().await;
        let pipeline = Pipeline::new()
            .group(
                Group::by(Expr::compound(&[
                    ("hour", Expr::HourOf("timestamp".to_string())),
                    ("type", Expr::field("type")),
                ]))
                .count("n"),
            )
            .sort_by("_id", SortOrder::Ascending);
        let rows = store.aggregate(&pipeline).await.unwrap();
        assert_eq!(rows.len(), 3);
        let keys: Vec<(String, String)> = rows
            .iter()
            .map(|row| {
                let key = row.get_document("_id").unwrap();
                (
                    key.get_str("hour").unwrap().to_string(),
                    key.get_str("type").unwrap().to_string(),
                )
            })
            .collect();
        assert!(keys.contains(&("2026-10-17T10".to_string(), "interior".to_string())));
        assert!(keys.contains(&("2026-10-17T09".to_string(), "exterior".to_string())));
        let position = keys
            .iter()
            .position(|(hour, _)| hour == "2026-10-17T10")
            .unwrap();
        assert_eq!(rows[position].get_i64("n").unwrap(), 2);
    }

    #[tokio::test]
    async fn count_by_groups_every_document() {
        let store = seeded().await;
        let counts = store.count_by("device_id").await.unwrap();
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));
        assert_eq!(counts.values().sum::<u64>(), 4);
        assert_eq!(store.count(&Filter::eq("type", "exterior")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn filters_do_not_compare_across_types() {
        let store = seeded().await;
        let docs = store
            .find(&FindQuery::matching(Filter::gte("temperature", "0")))
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn invalid_pipeline_is_rejected_not_empty() {
        let store = seeded().await;
        let err = store.aggregate(&Pipeline::new().limit(0)).await.unwrap_err();
        assert_eq!(err.kind(), "query");
    }

    #[tokio::test]
    async fn count_rejects_operator_field_names() {
        let store = seeded().await;
        let err = store
            .count(&Filter::eq("$where", "type"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query");
        let nested = Filter::eq("type", "interior").and(Filter::gte("", 1));
        assert_eq!(store.count(&nested).await.unwrap_err().kind(), "query");
    }

    #[tokio::test]
    async fn duplicate_identity_is_a_write_error() {
        let store = MemoryStore::new();
        let id = ObjectId::new();
        store.insert_one(doc! { "_id": id, "type": "interior" }).await.unwrap();
        let err = store
            .insert_one(doc! { "_id": id, "type": "interior" })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "write");
        assert_eq!(store.len(), 1);
    }
}
