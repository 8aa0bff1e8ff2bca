use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::codec::Document;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::store::{validate_field, DocumentStore, FindQuery, Namespace};

/// Shared database connection wrapped in Arc for zero-copy sharing across tasks
pub type SharedDb = Arc<Surreal<Client>>;

/// SurrealDB implementation of [`DocumentStore`].
///
/// A namespace's database is a SurrealDB database and its collection a
/// table. The session database is per connection, so each database gets its
/// own connection, opened on first use and kept for the process lifetime.
pub struct SurrealStore {
    config: StoreConfig,
    handles: Mutex<HashMap<String, SharedDb>>,
}

impl SurrealStore {
    /// Connects to the configured default database up front so an
    /// unreachable store fails at startup.
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        let store = Self {
            config,
            handles: Mutex::new(HashMap::new()),
        };
        let default_db = store.config.database.clone();
        store.handle(&default_db).await?;
        Ok(store)
    }

    async fn handle(&self, database: &str) -> Result<SharedDb, StoreError> {
        let mut handles = self.handles.lock().await;
        if let Some(db) = handles.get(database) {
            return Ok(db.clone());
        }
        let db = connect_database(&self.config, database).await?;
        handles.insert(database.to_string(), db.clone());
        Ok(db)
    }
}

pub async fn connect_database(config: &StoreConfig, database: &str) -> Result<SharedDb, StoreError> {
    let connection = |e: surrealdb::Error| StoreError::Connection(e.to_string());

    info!(addr = %config.addr(), database, "Connecting to SurrealDB");

    let db = Surreal::new::<Ws>(config.addr()).await.map_err(connection)?;

    if !config.password.is_empty() {
        db.signin(Root {
            username: config.user.clone(),
            password: config.password.clone(),
        })
        .await
        .map_err(connection)?;
    }

    db.use_ns(&config.namespace)
        .use_db(database)
        .await
        .map_err(connection)?;

    info!("Connected to SurrealDB successfully");
    Ok(Arc::new(db))
}

/// SurrealDB takes a document's `id` as its record id, so a business `id`
/// is kept under this field instead.
const STORED_ID_FIELD: &str = "__id";

fn stored_field(name: &str) -> &str {
    if name == "id" { STORED_ID_FIELD } else { name }
}

fn to_stored(mut document: Document) -> Document {
    if let Some(id) = document.shift_remove("id") {
        document.insert(STORED_ID_FIELD.to_string(), id);
    }
    document
}

fn from_stored(mut document: Document) -> Document {
    if let Some(id) = document.shift_remove(STORED_ID_FIELD) {
        document.insert("id".to_string(), id);
    }
    document
}

/// Builds the SELECT statement and its bindings for `query`.
fn select_statement(query: &FindQuery) -> Result<(String, Vec<(String, Value)>), StoreError> {
    let mut sql = String::from("SELECT * OMIT id FROM type::table($table)");
    let mut conditions = Vec::with_capacity(query.filter.len());
    let mut bindings = Vec::with_capacity(query.filter.len());

    for (idx, (field, value)) in query.filter.iter().enumerate() {
        validate_field(field)?;
        conditions.push(format!("`{}` = $f{}", stored_field(field), idx));
        bindings.push((format!("f{}", idx), value.clone()));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    if let Some(sort) = &query.sort_by {
        validate_field(sort)?;
        sql.push_str(&format!(" ORDER BY `{}` ASC", stored_field(sort)));
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    Ok((sql, bindings))
}

#[async_trait]
impl DocumentStore for SurrealStore {
    async fn insert(&self, ns: &Namespace, document: Document) -> Result<(), StoreError> {
        let db = self.handle(&ns.database).await?;

        db.query("CREATE type::table($table) CONTENT $document")
            .bind(("table", ns.collection.clone()))
            .bind(("document", Value::Object(to_stored(document))))
            .await?
            .check()?;

        debug!(database = %ns.database, collection = %ns.collection, "Inserted document");
        Ok(())
    }

    async fn find(&self, ns: &Namespace, query: &FindQuery) -> Result<Vec<Document>, StoreError> {
        let (sql, bindings) = select_statement(query)?;
        let db = self.handle(&ns.database).await?;

        let mut request = db.query(sql).bind(("table", ns.collection.clone()));
        for binding in bindings {
            request = request.bind(binding);
        }

        let mut response = request.await?.check()?;
        let rows: Vec<Value> = response.take(0)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(document) => Some(from_stored(document)),
                _ => None,
            })
            .collect())
    }
}
