//! In-memory collaborators for tests.
//!
//! They follow the same contracts as the Redis and SurrealDB
//! implementations closely enough to exercise the consumer loop and the
//! table service without a running broker or store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::broker::{StreamBroker, StreamEntry, StreamRead, NEW_ENTRIES};
use crate::codec::{Document, StreamMessage};
use crate::error::{BrokerError, StoreError};
use crate::store::{compare_values, DocumentStore, FindQuery, Namespace};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sequence(id: &str) -> u64 {
    id.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[derive(Default)]
struct GroupState {
    /// Number of stream entries already handed to the group.
    delivered: usize,
    /// Delivered, unacknowledged entries: (id, consumer), in delivery order.
    pending: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    streams: HashMap<String, Vec<(String, StreamMessage)>>,
    groups: HashMap<(String, String), GroupState>,
    fail_appends: bool,
}

impl BrokerState {
    fn append(&mut self, stream: &str, message: StreamMessage) -> String {
        self.next_id += 1;
        let id = format!("{}-0", self.next_id);
        self.streams
            .entry(stream.to_string())
            .or_default()
            .push((id.clone(), message));
        id
    }
}

/// Stream broker with Redis consumer-group semantics, held in memory.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry as an outside producer would.
    pub fn publish(&self, stream: &str, message: StreamMessage) -> String {
        lock(&self.state).append(stream, message)
    }

    /// Every entry ever appended to `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamMessage> {
        lock(&self.state)
            .streams
            .get(stream)
            .map(|entries| entries.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    /// Ids delivered to `group` on `stream` and not yet acknowledged.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<String> {
        lock(&self.state)
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.pending.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        lock(&self.state)
            .groups
            .contains_key(&(stream.to_string(), group.to_string()))
    }

    pub fn group_count(&self) -> usize {
        lock(&self.state).groups.len()
    }

    pub fn has_stream(&self, stream: &str) -> bool {
        lock(&self.state).streams.contains_key(stream)
    }

    /// Makes every following append fail.
    pub fn fail_appends(&self, fail: bool) {
        lock(&self.state).fail_appends = fail;
    }
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let key = (stream.to_string(), group.to_string());
        if state.groups.contains_key(&key) {
            return Err(BrokerError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        state.streams.entry(stream.to_string()).or_default();
        state.groups.insert(key, GroupState::default());
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        reads: &[StreamRead],
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let entries = {
            let mut state = lock(&self.state);
            let mut entries = Vec::new();

            for read in reads {
                let stream_entries = state.streams.get(&read.stream).cloned().unwrap_or_default();
                let Some(group_state) = state
                    .groups
                    .get_mut(&(read.stream.clone(), group.to_string()))
                else {
                    return Err(BrokerError::Command(format!(
                        "NOGROUP no consumer group {} on stream {}",
                        group, read.stream
                    )));
                };

                if read.after == NEW_ENTRIES {
                    let fresh: Vec<_> = stream_entries
                        .iter()
                        .skip(group_state.delivered)
                        .take(count)
                        .cloned()
                        .collect();
                    group_state.delivered += fresh.len();
                    for (id, message) in fresh {
                        group_state.pending.push((id.clone(), consumer.to_string()));
                        entries.push(StreamEntry {
                            stream: read.stream.clone(),
                            id,
                            message,
                        });
                    }
                } else {
                    let after = sequence(&read.after);
                    let replay = group_state
                        .pending
                        .iter()
                        .filter(|(id, owner)| owner == consumer && sequence(id) > after)
                        .take(count);
                    for (id, _) in replay {
                        let message = stream_entries
                            .iter()
                            .find(|(entry_id, _)| entry_id == id)
                            .map(|(_, m)| m.clone())
                            .unwrap_or_default();
                        entries.push(StreamEntry {
                            stream: read.stream.clone(),
                            id: id.clone(),
                            message,
                        });
                    }
                }
            }
            entries
        };

        if entries.is_empty() {
            if let Some(block) = block {
                tokio::time::sleep(block).await;
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if let Some(group_state) = state.groups.get_mut(&(stream.to_string(), group.to_string())) {
            group_state.pending.retain(|(pending_id, _)| pending_id != id);
        }
        Ok(())
    }

    async fn append(&self, stream: &str, message: &StreamMessage) -> Result<String, BrokerError> {
        let mut state = lock(&self.state);
        if state.fail_appends {
            return Err(BrokerError::Command("append refused".to_string()));
        }
        Ok(state.append(stream, message.clone()))
    }
}

/// Document store held in memory.
///
/// Record ids are kept beside the documents, never inside them, so a
/// business field named `id` round-trips like any other field.
#[derive(Default)]
pub struct InMemoryStore {
    documents: Mutex<HashMap<Namespace, Vec<(u64, Document)>>>,
    failing: AtomicBool,
    sorted_keys: AtomicBool,
    next_id: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that hands documents back with object keys in sorted order,
    /// at every nesting level, as SurrealDB does.
    pub fn with_sorted_keys() -> Self {
        let store = Self::default();
        store.sorted_keys.store(true, Ordering::SeqCst);
        store
    }

    /// While set, every operation fails with a query error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stored documents of `ns`, in insertion order.
    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        lock(&self.documents)
            .get(ns)
            .map(|documents| documents.iter().map(|(_, doc)| doc.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of records of `ns`.
    pub fn record_count(&self, ns: &Namespace) -> usize {
        lock(&self.documents).get(ns).map(Vec::len).unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Query("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert(&self, ns: &Namespace, document: Document) -> Result<(), StoreError> {
        self.check()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.documents).entry(ns.clone()).or_default().push((id, document));
        Ok(())
    }

    async fn find(&self, ns: &Namespace, query: &FindQuery) -> Result<Vec<Document>, StoreError> {
        self.check()?;

        let mut matches: Vec<Document> = lock(&self.documents)
            .get(ns)
            .map(|documents| {
                documents
                    .iter()
                    .map(|(_, doc)| doc)
                    .filter(|doc| query.filter.iter().all(|(field, value)| doc.get(field) == Some(value)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(sort) = &query.sort_by {
            matches.sort_by(|a, b| compare_values(a.get(sort), b.get(sort)));
        }
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        if self.sorted_keys.load(Ordering::SeqCst) {
            matches = matches
                .into_iter()
                .filter_map(|doc| match sort_keys(Value::Object(doc)) {
                    Value::Object(doc) => Some(doc),
                    _ => None,
                })
                .collect();
        }
        Ok(matches)
    }
}
