use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::broker::StreamEntry;
use crate::codec::{decode, Document, MessageType, ReadParams, Request};
use crate::config::ConsumerSettings;
use crate::error::{BrokerError, DecodeError};
use crate::metrics::SyncMetrics;
use crate::producer::Producer;
use crate::store::TableStore;

/// What the consumer does with an entry after it was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The terminal action succeeded; acknowledge.
    Ack,
    /// Leave the entry pending (dropped input, or waiting on the updater).
    Leave,
}

/// Routes requests to the store and produces the follow-up message.
///
/// | request        | action                | emits                         | ack   |
/// |----------------|-----------------------|-------------------------------|-------|
/// | DATA_FETCHED   | insert payload        | DATA_STORED → response stream | yes   |
/// | DATA_REQUESTED | sorted read, hit      | DATA_READ → response stream   | yes   |
/// | DATA_REQUESTED | sorted read, miss     | FETCH_REQUEST → updater       | no    |
#[derive(Clone)]
pub struct RequestHandler {
    store: TableStore,
    producer: Producer,
    response_stream: String,
    updater_stream: String,
    metrics: SyncMetrics,
}

impl RequestHandler {
    pub fn new(store: TableStore, producer: Producer, settings: &ConsumerSettings, metrics: SyncMetrics) -> Self {
        Self {
            store,
            producer,
            response_stream: settings.response_stream.clone(),
            updater_stream: settings.updater_stream.clone(),
            metrics,
        }
    }

    /// Handles one entry.
    ///
    /// Entries that cannot be decoded into a request are logged and left
    /// pending. Only broker failures (produce) are returned as errors. The
    /// handling time is recorded for every outcome.
    #[instrument(skip(self, entry), fields(stream = %entry.stream, message_id = %entry.id))]
    pub async fn handle(&self, entry: &StreamEntry) -> Result<Disposition, BrokerError> {
        let start = Instant::now();
        let result = self.dispatch(entry).await;
        self.metrics
            .handle_duration
            .record(start.elapsed().as_secs_f64() * 1000.0, &[]);
        result
    }

    async fn dispatch(&self, entry: &StreamEntry) -> Result<Disposition, BrokerError> {
        let request = match decode(&entry.message).and_then(|decoded| {
            self.metrics.record_message(decoded.message_type);
            Request::try_from(decoded)
        }) {
            Ok(request) => request,
            Err(e) => return Ok(self.drop_entry(entry, e)),
        };

        match request {
            Request::DataFetched {
                request_id,
                document,
            } => self.store_fetched(&request_id, document).await,
            Request::DataRequested { request_id, params } => self.answer_read(&request_id, &params).await,
        }
    }

    fn drop_entry(&self, entry: &StreamEntry, err: DecodeError) -> Disposition {
        error!(stream = %entry.stream, message_id = %entry.id, error = %err, "Interface error, message dropped");
        self.metrics.record_dropped(err.reason());
        Disposition::Leave
    }

    async fn store_fetched(&self, request_id: &str, document: Document) -> Result<Disposition, BrokerError> {
        debug!(request_id, "Writing fetched data");

        let payload = match self.store.write(document).await {
            Ok(()) => json!({}),
            Err(e) => {
                self.metrics.record_store_failure("insert");
                json!({ "error": e.to_string() })
            }
        };

        self.producer
            .produce(MessageType::DataStored, request_id, &payload, &self.response_stream)
            .await?;
        Ok(Disposition::Ack)
    }

    async fn answer_read(&self, request_id: &str, params: &ReadParams) -> Result<Disposition, BrokerError> {
        debug!(request_id, sort_key = %params.sort_key, "Processing read request");

        let document = self.store.read(params).await;
        if !document.is_empty() {
            self.producer
                .produce(
                    MessageType::DataRead,
                    request_id,
                    &Value::Object(document),
                    &self.response_stream,
                )
                .await?;
            return Ok(Disposition::Ack);
        }

        info!(request_id, "Data not stored, forwarding fetch request to updater");
        self.producer
            .produce(
                MessageType::FetchRequest,
                request_id,
                &Value::Object(params.to_payload()),
                &self.updater_stream,
            )
            .await?;
        self.metrics.fetch_forwards.add(1, &[]);
        Ok(Disposition::Leave)
    }
}
