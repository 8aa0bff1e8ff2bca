use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::broker::{bounded, StreamBroker};
use crate::codec::{encode, MessageType};
use crate::error::BrokerError;

#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn StreamBroker>,
    timeout: Duration,
}

impl Producer {
    pub fn new(broker: Arc<dyn StreamBroker>, timeout: Duration) -> Self {
        Self { broker, timeout }
    }

    /// Encodes and appends one message, returning the broker-assigned id.
    ///
    /// A payload that is not an object is not sent and yields `None`.
    /// Append failures are returned as-is; there is no retry here.
    pub async fn produce(
        &self,
        message_type: MessageType,
        request_id: &str,
        payload: &Value,
        stream: &str,
    ) -> Result<Option<String>, BrokerError> {
        let Some(message) = encode(message_type, request_id, payload) else {
            warn!(%message_type, request_id, stream, "Payload is not a mapping, message not produced");
            return Ok(None);
        };

        let id = bounded("append", self.timeout, self.broker.append(stream, &message)).await?;
        info!(%message_type, request_id, stream, id = %id, "Produced message");
        Ok(Some(id))
    }
}
