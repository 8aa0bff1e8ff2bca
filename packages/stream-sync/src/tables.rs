//! Logical tables on top of the document store.
//!
//! A table is every document in a collection whose `meta` equals
//! `{table, collection}`. The first write creates it; later writes add a
//! document holding only the rows the table does not have yet.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::codec::Document;
use crate::dedup::novel_rows;
use crate::error::StoreError;
use crate::metrics::SyncMetrics;
use crate::store::{bounded, DocumentStore, FindQuery, Namespace};

pub const META_FIELD: &str = "meta";
pub const DATA_FIELD: &str = "data";

pub mod stage {
    pub const REQUEST_PARSED: &str = "request_parsed";
    pub const EXISTING_TABLE_QUERIED: &str = "existing_table_queried";
    pub const TABLE_CREATED: &str = "table_created";
    pub const ROWS_DEDUPLICATED: &str = "rows_deduplicated";
    pub const ROWS_INSERTED: &str = "rows_inserted";
    pub const TABLE_QUERIED: &str = "table_queried";
    pub const ROWS_COLLECTED: &str = "rows_collected";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub table: String,
    pub collection: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheInfo {
    pub destination: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WriteTableRequest {
    pub cache_info: CacheInfo,
    pub meta: TableMeta,
    pub data: Vec<Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReadTableRequest {
    pub collection: String,
    pub table: String,
    #[serde(default)]
    pub filters: Document,
    #[serde(default)]
    pub destination: Option<String>,
}

/// Stages completed while serving one request, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Trace(Vec<&'static str>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: &'static str) {
        self.0.push(stage);
    }

    pub fn stages(&self) -> &[&'static str] {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No document existed for the table; the whole payload was inserted.
    Created { rows: usize },
    /// Only the novel rows were inserted.
    Appended { rows: usize },
    /// Every incoming row is already stored; nothing was written.
    UpToDate,
}

#[derive(Clone)]
pub struct TableService {
    store: Arc<dyn DocumentStore>,
    default_database: String,
    timeout: Duration,
    metrics: SyncMetrics,
}

impl TableService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        default_database: impl Into<String>,
        timeout: Duration,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            store,
            default_database: default_database.into(),
            timeout,
            metrics,
        }
    }

    fn meta_query(meta: &TableMeta) -> FindQuery {
        let mut filter = Document::new();
        filter.insert(META_FIELD.to_string(), json!(meta));
        FindQuery {
            filter,
            ..FindQuery::default()
        }
    }

    #[instrument(skip(self, request, trace), fields(table = %request.meta.table, collection = %request.meta.collection))]
    pub async fn write(&self, request: WriteTableRequest, trace: &mut Trace) -> Result<WriteOutcome, StoreError> {
        let WriteTableRequest { cache_info, meta, data } = request;
        let ns = Namespace::new(cache_info.destination, meta.collection.clone());

        let existing = bounded("find", self.timeout, self.store.find(&ns, &Self::meta_query(&meta)))
            .await
            .inspect_err(|_| self.metrics.record_store_failure("find"))?;
        trace.record(stage::EXISTING_TABLE_QUERIED);

        if existing.is_empty() {
            let rows = data.len();
            self.insert(&ns, &meta, data).await?;
            trace.record(stage::TABLE_CREATED);
            info!(rows, "Created table");
            return Ok(WriteOutcome::Created { rows });
        }

        let existing_rows = collect_rows(existing);
        let novel = novel_rows(&data, &existing_rows);
        trace.record(stage::ROWS_DEDUPLICATED);
        debug!(incoming = data.len(), existing = existing_rows.len(), novel = novel.len(), "Deduplicated rows");

        if novel.is_empty() {
            info!("Table already up to date");
            return Ok(WriteOutcome::UpToDate);
        }

        let rows = novel.len();
        self.insert(&ns, &meta, novel).await?;
        trace.record(stage::ROWS_INSERTED);
        info!(rows, "Appended rows to table");
        Ok(WriteOutcome::Appended { rows })
    }

    async fn insert(&self, ns: &Namespace, meta: &TableMeta, rows: Vec<Value>) -> Result<(), StoreError> {
        let count = rows.len() as u64;
        let mut document = Document::new();
        document.insert(META_FIELD.to_string(), json!(meta));
        document.insert(DATA_FIELD.to_string(), Value::Array(rows));

        let inserted = bounded("insert", self.timeout, self.store.insert(ns, document)).await;
        match &inserted {
            Ok(()) => self.metrics.rows_inserted.add(count, &[]),
            Err(_) => self.metrics.record_store_failure("insert"),
        }
        inserted
    }

    /// All rows of the table, in document order. An empty result means the
    /// table has no rows matching the filters.
    #[instrument(skip(self, request, trace), fields(table = %request.table, collection = %request.collection))]
    pub async fn read(&self, request: ReadTableRequest, trace: &mut Trace) -> Result<Vec<Value>, StoreError> {
        let ReadTableRequest {
            collection,
            table,
            filters,
            destination,
        } = request;
        let database = destination.unwrap_or_else(|| self.default_database.clone());
        let meta = TableMeta {
            table,
            collection: collection.clone(),
        };

        let mut query = Self::meta_query(&meta);
        for (field, value) in filters {
            if field != META_FIELD {
                query.filter.insert(field, value);
            }
        }

        let ns = Namespace::new(database, collection);
        let documents = bounded("find", self.timeout, self.store.find(&ns, &query))
            .await
            .inspect_err(|_| self.metrics.record_store_failure("find"))?;
        trace.record(stage::TABLE_QUERIED);

        let rows = collect_rows(documents);
        trace.record(stage::ROWS_COLLECTED);
        debug!(rows = rows.len(), "Collected table rows");
        Ok(rows)
    }
}

/// Concatenates the `data` rows of every document.
fn collect_rows(documents: Vec<Document>) -> Vec<Value> {
    documents
        .into_iter()
        .filter_map(|mut document| document.shift_remove(DATA_FIELD))
        .flat_map(|data| match data {
            Value::Array(rows) => rows,
            other => vec![other],
        })
        .collect()
}
