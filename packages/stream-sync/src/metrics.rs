use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::codec::MessageType;

#[derive(Clone)]
pub struct SyncMetrics {
    pub messages: Counter<u64>,
    pub acks: Counter<u64>,
    pub fetch_forwards: Counter<u64>,
    pub dropped: Counter<u64>,
    pub store_failures: Counter<u64>,
    pub rows_inserted: Counter<u64>,
    pub handle_duration: Histogram<f64>,
}

impl SyncMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            messages: meter
                .u64_counter("sync_messages_total")
                .with_description("Stream entries handled, by message type")
                .build(),
            acks: meter
                .u64_counter("sync_acks_total")
                .with_description("Stream entries acknowledged")
                .build(),
            fetch_forwards: meter
                .u64_counter("sync_fetch_forwards_total")
                .with_description("Read misses forwarded to the updater")
                .build(),
            dropped: meter
                .u64_counter("sync_dropped_total")
                .with_description("Stream entries dropped without handling")
                .build(),
            store_failures: meter
                .u64_counter("sync_store_failures_total")
                .with_description("Failed document store operations")
                .build(),
            rows_inserted: meter
                .u64_counter("sync_rows_inserted_total")
                .with_description("Table rows inserted after deduplication")
                .build(),
            handle_duration: meter
                .f64_histogram("sync_handle_duration_milliseconds")
                .with_description("Time spent handling one stream entry")
                .build(),
        }
    }

    /// Instruments on the global meter provider; no-ops until one is installed.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("stream-sync"))
    }

    pub fn record_message(&self, message_type: MessageType) {
        self.messages
            .add(1, &[KeyValue::new("type", message_type.as_str())]);
    }

    pub fn record_dropped(&self, reason: &'static str) {
        self.dropped.add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn record_store_failure(&self, op: &'static str) {
        self.store_failures.add(1, &[KeyValue::new("op", op)]);
    }
}
