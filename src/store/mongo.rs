use super::pipeline::{Accumulator, Expr, Filter, FindQuery, Pipeline, SortOrder, Stage};
use super::DocumentStore;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, IndexModel};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub connection_string: String,
    pub database: String,
    pub collection: String,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub app_name: String,
}

#[derive(Debug, Clone)]
pub struct ServerOverview {
    pub databases: Vec<String>,
    pub collection_exists: bool,
    pub documents: u64,
}

/// MongoDB-backed [`DocumentStore`]. One driver client per process; clones share its
/// connection pool.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
    database: String,
    collection_name: String,
    connect_timeout: Duration,
    operation_timeout: Duration,
}

impl MongoStore {
    /// Parses the connection string, builds the client and pings the deployment. Every step
    /// is bounded by the connect timeout.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let connect_timeout = config.connect_timeout;
        let mut options = bounded("connect", connect_timeout, async {
            ClientOptions::parse(config.connection_string.as_str()).await
        })
        .await?;
        options.app_name = Some(config.app_name.clone());
        options.connect_timeout = Some(connect_timeout);
        options.server_selection_timeout = Some(connect_timeout);

        let client =
            Client::with_options(options).map_err(|err| translate("connect", connect_timeout, err))?;
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.collection);
        let store = Self {
            client,
            collection,
            database: config.database.clone(),
            collection_name: config.collection.clone(),
            connect_timeout,
            operation_timeout: config.operation_timeout,
        };
        store.ping().await?;
        tracing::info!(
            database = %store.database,
            collection = %store.collection_name,
            "connected to document store"
        );
        Ok(store)
    }

    pub async fn ping(&self) -> StoreResult<()> {
        let admin = self.client.database("admin");
        bounded("ping", self.connect_timeout, async {
            admin.run_command(doc! { "ping": 1 }).await
        })
        .await?;
        Ok(())
    }

    /// Creates the `timestamp`-descending index used by newest-first reads.
    pub async fn ensure_indexes(&self) -> StoreResult<()> {
        let index = IndexModel::builder().keys(doc! { "timestamp": -1 }).build();
        bounded("create_index", self.operation_timeout, async {
            self.collection.create_index(index).await
        })
        .await?;
        Ok(())
    }

    pub async fn server_overview(&self) -> StoreResult<ServerOverview> {
        let databases = bounded("list_databases", self.operation_timeout, async {
            self.client.list_database_names().await
        })
        .await?;
        let collections = bounded("list_collections", self.operation_timeout, async {
            self.client.database(&self.database).list_collection_names().await
        })
        .await?;
        let documents = self.count(&Filter::All).await?;
        Ok(ServerOverview {
            databases,
            collection_exists: collections.iter().any(|name| *name == self.collection_name),
            documents,
        })
    }

    pub async fn shutdown(self) {
        self.client.shutdown().await;
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn insert_one(&self, document: Document) -> StoreResult<String> {
        let result = bounded("insert_one", self.operation_timeout, async {
            self.collection.insert_one(document).await
        })
        .await?;
        Ok(match result.inserted_id {
            Bson::ObjectId(id) => id.to_hex(),
            other => other.to_string(),
        })
    }

    async fn find(&self, query: &FindQuery) -> StoreResult<Vec<Document>> {
        query.validate()?;
        let filter = compile_filter(&query.filter);
        let sort = query.sort.as_ref().map(|(field, order)| {
            let mut sort = Document::new();
            sort.insert(field.clone(), sort_direction(*order));
            sort
        });
        bounded("find", self.operation_timeout, async {
            let mut action = self.collection.find(filter);
            if let Some(sort) = sort {
                action = action.sort(sort);
            }
            if let Some(limit) = query.limit {
                action = action.limit(limit);
            }
            let cursor = action.await?;
            cursor.try_collect::<Vec<Document>>().await
        })
        .await
        .inspect_err(|err| {
            tracing::warn!(filter = ?query.filter, limit = ?query.limit, error = %err, "find failed")
        })
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> StoreResult<Vec<Document>> {
        pipeline.validate()?;
        let stages = compile_pipeline(pipeline);
        bounded("aggregate", self.operation_timeout, async {
            let cursor = self.collection.aggregate(stages).await?;
            cursor.try_collect::<Vec<Document>>().await
        })
        .await
        .inspect_err(|err| {
            tracing::warn!(pipeline = %pipeline.shape(), error = %err, "aggregation failed")
        })
    }

    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        filter.validate()?;
        let filter = compile_filter(filter);
        bounded("count", self.operation_timeout, async {
            self.collection.count_documents(filter).await
        })
        .await
    }
}

/// Runs a driver call under `limit`, translating both the elapsed timer and driver errors.
async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = mongodb::error::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(translate(operation, limit, err)),
        Err(_) => Err(StoreError::Timeout { operation, limit }),
    }
}

fn translate(operation: &'static str, limit: Duration, err: mongodb::error::Error) -> StoreError {
    let message = err.to_string();
    match err.kind.as_ref() {
        ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            StoreError::Timeout { operation, limit }
        }
        // Anything that stops the session from being established, including a malformed
        // connection string.
        _ if matches!(operation, "connect" | "ping") => {
            StoreError::Connection { operation, message }
        }
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::Authentication { .. } => StoreError::Connection { operation, message },
        _ if operation == "insert_one" => StoreError::Write { operation, message },
        _ => StoreError::Query { operation, message },
    }
}

fn sort_direction(order: SortOrder) -> i32 {
    match order {
        SortOrder::Ascending => 1,
        SortOrder::Descending => -1,
    }
}

fn field_ref(name: &str) -> Bson {
    Bson::String(format!("${name}"))
}

pub(crate) fn compile_filter(filter: &Filter) -> Document {
    match filter {
        Filter::All => Document::new(),
        Filter::Eq(field, value) => {
            let mut out = Document::new();
            out.insert(field.clone(), value.clone());
            out
        }
        Filter::Gte(field, value) => {
            let mut out = Document::new();
            out.insert(field.clone(), doc! { "$gte": value.clone() });
            out
        }
        Filter::Lt(field, value) => {
            let mut out = Document::new();
            out.insert(field.clone(), doc! { "$lt": value.clone() });
            out
        }
        Filter::And(parts) => {
            let parts: Vec<Bson> = parts
                .iter()
                .map(|part| Bson::Document(compile_filter(part)))
                .collect();
            doc! { "$and": parts }
        }
    }
}

pub(crate) fn compile_expr(expr: &Expr) -> Bson {
    match expr {
        Expr::Field(name) => field_ref(name),
        Expr::CelsiusTemperature => Bson::Document(doc! {
            "$cond": {
                "if": { "$eq": ["$unit", "F"] },
                "then": {
                    "$divide": [
                        { "$multiply": [{ "$subtract": ["$temperature", 32] }, 5] },
                        9
                    ]
                },
                "else": "$temperature"
            }
        }),
        Expr::HourOf(name) => Bson::Document(doc! {
            "$substrBytes": [field_ref(name), 0, 13]
        }),
        Expr::Compound(parts) => {
            let mut out = Document::new();
            for (name, part) in parts {
                out.insert(name.clone(), compile_expr(part));
            }
            Bson::Document(out)
        }
        Expr::Literal(value) => Bson::Document(doc! { "$literal": value.clone() }),
    }
}

fn compile_accumulator(accumulator: &Accumulator) -> Bson {
    let (op, expr) = match accumulator {
        Accumulator::Count => return Bson::Document(doc! { "$sum": 1 }),
        Accumulator::Sum(expr) => ("$sum", expr),
        Accumulator::Avg(expr) => ("$avg", expr),
        Accumulator::Min(expr) => ("$min", expr),
        Accumulator::Max(expr) => ("$max", expr),
        Accumulator::First(expr) => ("$first", expr),
    };
    let mut out = Document::new();
    out.insert(op, compile_expr(expr));
    Bson::Document(out)
}

pub(crate) fn compile_pipeline(pipeline: &Pipeline) -> Vec<Document> {
    pipeline
        .stages()
        .iter()
        .map(|stage| match stage {
            Stage::Match(filter) => doc! { "$match": compile_filter(filter) },
            Stage::Project(projection) => {
                let mut fields = Document::new();
                for (name, expr) in &projection.fields {
                    fields.insert(name.clone(), compile_expr(expr));
                }
                doc! { "$project": fields }
            }
            Stage::Group(group) => {
                let mut body = Document::new();
                body.insert("_id", compile_expr(&group.key));
                for (name, accumulator) in &group.outputs {
                    body.insert(name.clone(), compile_accumulator(accumulator));
                }
                doc! { "$group": body }
            }
            Stage::Sort(keys) => {
                let mut body = Document::new();
                for (field, order) in keys {
                    body.insert(field.clone(), sort_direction(*order));
                }
                doc! { "$sort": body }
            }
            Stage::Limit(limit) => doc! { "$limit": *limit },
        })
        .collect()
}
