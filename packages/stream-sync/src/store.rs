use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::codec::{Document, ReadParams, PARAMS_FIELD};
use crate::error::StoreError;

/// Upper bound on candidates fetched by a sorted read.
pub const READ_CANDIDATES: usize = 100;

/// Two-level document namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

/// Exact-match query against one collection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindQuery {
    /// Top-level field name to the exact value it must hold.
    pub filter: Document,
    /// Ascending sort field.
    pub sort_by: Option<String>,
    pub limit: Option<usize>,
}

/// Document store collaborator.
///
/// Implementations never return the store-assigned record identifier.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, ns: &Namespace, document: Document) -> Result<(), StoreError>;

    async fn find(&self, ns: &Namespace, query: &FindQuery) -> Result<Vec<Document>, StoreError>;
}

/// Field names are interpolated into queries, so they are restricted to
/// plain identifiers.
pub fn validate_field(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidField(name.to_string()))
    }
}

pub(crate) async fn bounded<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout {
            op,
            millis: limit.as_millis(),
        })?
}

/// Store adapter used by the message path: one fixed namespace, every call
/// bounded by the operation timeout.
#[derive(Clone)]
pub struct TableStore {
    store: Arc<dyn DocumentStore>,
    namespace: Namespace,
    timeout: Duration,
}

impl TableStore {
    pub fn new(store: Arc<dyn DocumentStore>, namespace: Namespace, timeout: Duration) -> Self {
        Self {
            store,
            namespace,
            timeout,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Inserts one document. The error is returned for the caller to report;
    /// nothing is retried.
    pub async fn write(&self, document: Document) -> Result<(), StoreError> {
        debug!(collection = %self.namespace.collection, fields = document.len(), "Writing document");
        let result = bounded("insert", self.timeout, self.store.insert(&self.namespace, document)).await;
        if let Err(e) = &result {
            error!(error = %e, "Error processing write request");
        }
        result
    }

    /// First document whose `params` field equals `params.filter`, sorted
    /// by `params.sort_key`.
    ///
    /// An empty document is the only not-found signal: no match, an invalid
    /// sort key and a store failure all come back empty.
    pub async fn read(&self, params: &ReadParams) -> Document {
        let mut filter = Document::new();
        filter.insert(PARAMS_FIELD.to_string(), Value::Object(params.filter.clone()));
        let query = FindQuery {
            filter,
            sort_by: Some(params.sort_key.clone()),
            limit: Some(READ_CANDIDATES),
        };

        match bounded("find", self.timeout, self.store.find(&self.namespace, &query)).await {
            Ok(documents) => match documents.into_iter().next() {
                Some(document) => document,
                None => {
                    debug!(sort_key = %params.sort_key, "No document matched read request");
                    Document::new()
                }
            },
            Err(e) => {
                warn!(error = %e, "Error processing read request");
                Document::new()
            }
        }
    }
}

/// Orders two JSON values for sorting: numbers numerically, strings
/// lexically, missing/null first, mixed kinds by kind.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y))
            if matches!(x, Value::Array(_) | Value::Object(_)) && rank(a) == rank(b) =>
        {
            x.to_string().cmp(&y.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cmp::Ordering;

    #[test]
    fn field_names_are_identifiers() {
        assert!(validate_field("timestamp").is_ok());
        assert!(validate_field("_meta2").is_ok());
        assert!(validate_field("").is_err());
        assert!(validate_field("2fast").is_err());
        assert!(validate_field("price; DELETE main").is_err());
    }

    #[test]
    fn values_compare_by_kind_then_content() {
        assert_eq!(compare_values(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
        assert_eq!(compare_values(None, Some(&json!(0))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!("1")), Some(&json!(1))), Ordering::Greater);
    }
}
