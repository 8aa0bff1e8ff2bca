//! Shared setup for the consumer and table tests.
#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stream_sync::testing::{InMemoryBroker, InMemoryStore};
use stream_sync::{
    ConsumerSettings, Document, GroupConsumer, Namespace, Producer, RequestHandler, StreamMessage,
    SyncMetrics, TableStore,
};

pub struct Harness {
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<InMemoryStore>,
    pub settings: ConsumerSettings,
    pub ns: Namespace,
}

pub fn harness() -> Harness {
    Harness {
        broker: Arc::new(InMemoryBroker::new()),
        store: Arc::new(InMemoryStore::new()),
        settings: ConsumerSettings {
            block: Duration::from_millis(10),
            operation_timeout: Duration::from_secs(1),
            ..ConsumerSettings::default()
        },
        ns: Namespace::new("stonksdev", "main"),
    }
}

impl Harness {
    pub fn table_store(&self) -> TableStore {
        TableStore::new(self.store.clone(), self.ns.clone(), self.settings.operation_timeout)
    }

    pub fn handler(&self) -> RequestHandler {
        self.handler_with_metrics(SyncMetrics::global())
    }

    pub fn handler_with_metrics(&self, metrics: SyncMetrics) -> RequestHandler {
        let producer = Producer::new(self.broker.clone(), self.settings.operation_timeout);
        RequestHandler::new(self.table_store(), producer, &self.settings, metrics)
    }

    /// A fresh consumer, as after a process restart.
    pub fn consumer(&self) -> GroupConsumer {
        GroupConsumer::new(
            self.broker.clone(),
            self.handler(),
            self.settings.clone(),
            SyncMetrics::global(),
        )
    }
}

pub fn message(pairs: &[(&str, &str)]) -> StreamMessage {
    pairs.iter().map(|(k, v)| (*k, v.as_bytes().to_vec())).collect()
}

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

pub fn text(message: &StreamMessage, field: &str) -> Option<String> {
    message.get_text(field)
}
