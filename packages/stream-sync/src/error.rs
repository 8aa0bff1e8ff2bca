use thiserror::Error;

/// Failures talking to the stream broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The consumer group already exists on the stream (Redis `BUSYGROUP`).
    #[error("consumer group {group} already exists on stream {stream}")]
    GroupExists { stream: String, group: String },

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("broker operation `{op}` timed out after {millis}ms")]
    Timeout { op: &'static str, millis: u128 },
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Command(err.to_string())
    }
}

/// Failures talking to the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),

    #[error("invalid field name `{0}`")]
    InvalidField(String),

    #[error("store operation `{op}` timed out after {millis}ms")]
    Timeout { op: &'static str, millis: u128 },

    #[error("store connection failed: {0}")]
    Connection(String),
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

/// A stream entry that cannot be turned into a request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("message type {0} is not handled by this service")]
    Unsupported(String),
}

impl DecodeError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::MissingField(_) => "missing_field",
            DecodeError::UnknownType(_) => "unknown_type",
            DecodeError::Unsupported(_) => "unsupported_type",
        }
    }
}

/// Errors that stop the consumer loop.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
