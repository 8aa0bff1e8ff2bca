use async_trait::async_trait;
use std::time::Duration;

use crate::codec::StreamMessage;
use crate::error::BrokerError;

/// Read position for the group reads.
pub const NEW_ENTRIES: &str = ">";
/// Start of the consumer's pending entry list.
pub const PENDING_ORIGIN: &str = "0";

/// One entry claimed from a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: String,
    pub message: StreamMessage,
}

/// A single stream position to read from inside a group read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRead {
    pub stream: String,
    /// `>` for never-delivered entries, any other id to page through the
    /// consumer's own pending entries after that id.
    pub after: String,
}

/// Append-only stream broker with consumer groups.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Creates `group` on `stream` at the stream origin, creating the stream
    /// if needed. Returns [`BrokerError::GroupExists`] when already present.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Claims up to `count` entries for `consumer`. With `block` set the call
    /// waits at most that long for new entries; an empty result is a timeout.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        reads: &[StreamRead],
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    /// Appends an entry and returns the broker-assigned id.
    async fn append(&self, stream: &str, message: &StreamMessage) -> Result<String, BrokerError>;
}

/// Bounds a broker round trip by `limit`.
pub(crate) async fn bounded<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, BrokerError>
where
    F: std::future::Future<Output = Result<T, BrokerError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BrokerError::Timeout {
            op,
            millis: limit.as_millis(),
        })?
}
