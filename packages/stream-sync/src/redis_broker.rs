use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadOptions;
use redis::{AsyncCommands, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{StreamBroker, StreamEntry, StreamRead, PENDING_ORIGIN};
use crate::codec::StreamMessage;
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Redis Streams implementation of [`StreamBroker`].
///
/// The connection manager is cloned per command; clones share one
/// multiplexed connection that reconnects on its own.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        info!(host = %config.host, port = config.port, "Connecting to Redis");
        let client = redis::Client::open(config.url())?;
        let conn = client.get_connection_manager().await?;
        info!("Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(stream, group, PENDING_ORIGIN)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Err(BrokerError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        reads: &[StreamRead],
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        if reads.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<&str> = reads.iter().map(|r| r.stream.as_str()).collect();
        let ids: Vec<&str> = reads.iter().map(|r| r.after.as_str()).collect();

        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }

        let mut conn = self.conn.clone();
        // Parsed by hand: the typed reply needs UTF-8 field names and loses
        // field order.
        let reply: Value = conn.xread_options(&keys, &ids, &options).await?;
        let entries = parse_read_reply(reply)?;

        debug!(count = entries.len(), "Read entries from Redis");
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _acked: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, message: &StreamMessage) -> Result<String, BrokerError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", message.fields()).await?;
        Ok(id)
    }
}

/// Text of a name-like reply element; invalid UTF-8 is replaced.
fn reply_text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::VerbatimString { text, .. } => Some(text.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Raw bytes of a field value.
fn reply_bytes(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes),
        Value::SimpleString(s) => Some(s.into_bytes()),
        Value::VerbatimString { text, .. } => Some(text.into_bytes()),
        Value::Int(i) => Some(i.to_string().into_bytes()),
        Value::Double(d) => Some(d.to_string().into_bytes()),
        _ => None,
    }
}

fn malformed(what: &str, value: &Value) -> BrokerError {
    BrokerError::Command(format!("unexpected XREADGROUP reply, {}: {:?}", what, value))
}

/// Splits a reply into key/value pairs: RESP3 maps, or RESP2 two-element
/// arrays.
fn reply_pairs(value: Value) -> Result<Vec<(Value, Value)>, BrokerError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Map(pairs) => Ok(pairs),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(pair) if pair.len() == 2 => {
                    let mut pair = pair.into_iter();
                    match (pair.next(), pair.next()) {
                        (Some(key), Some(value)) => Ok((key, value)),
                        _ => Err(BrokerError::Command("unexpected XREADGROUP reply pair".to_string())),
                    }
                }
                other => Err(malformed("expected a pair", &other)),
            })
            .collect(),
        other => Err(malformed("expected pairs", &other)),
    }
}

/// Flat `field value field value ...` list of one entry, in wire order.
fn parse_fields(stream: &str, id: &str, value: Value) -> StreamMessage {
    let items = match value {
        // Deleted entries still listed as pending come back without fields.
        Value::Nil => Vec::new(),
        Value::Array(items) => items,
        Value::Map(pairs) => pairs.into_iter().flat_map(|(k, v)| [k, v]).collect(),
        other => {
            warn!(stream, message_id = id, reply = ?other, "Entry fields are not a list");
            Vec::new()
        }
    };

    let mut message = StreamMessage::new();
    let mut items = items.into_iter();
    while let (Some(name), Some(value)) = (items.next(), items.next()) {
        let Some(name) = reply_text(&name) else {
            warn!(stream, message_id = id, field = ?name, "Skipping field with a non-text name");
            continue;
        };
        match reply_bytes(value) {
            Some(bytes) => message.push(name, bytes),
            None => warn!(stream, message_id = id, field = %name, "Skipping field with a non-scalar value"),
        }
    }
    message
}

/// Turns an XREADGROUP reply into entries, streams and entries in reply
/// order. A nil reply (blocking read timed out) is an empty batch.
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, BrokerError> {
    let mut entries = Vec::new();
    for (stream, stream_entries) in reply_pairs(reply)? {
        let stream = reply_text(&stream).ok_or_else(|| malformed("stream name", &stream))?;
        for (id, fields) in reply_pairs(stream_entries)? {
            let id = reply_text(&id).ok_or_else(|| malformed("entry id", &id))?;
            let message = parse_fields(&stream, &id, fields);
            entries.push(StreamEntry {
                stream: stream.clone(),
                id,
                message,
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &[u8]) -> Value {
        Value::BulkString(s.to_vec())
    }

    fn entry(id: &str, fields: Vec<Value>) -> Value {
        Value::Array(vec![bulk(id.as_bytes()), Value::Array(fields)])
    }

    #[test]
    fn nil_reply_is_an_empty_batch() {
        assert!(parse_read_reply(Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn fields_keep_wire_order() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk(b"client-out"),
            Value::Array(vec![entry(
                "1-0",
                vec![
                    bulk(b"symbol"),
                    bulk(b"AAPL"),
                    bulk(b"type"),
                    bulk(b"DATA_REQUESTED"),
                    bulk(b"request_id"),
                    bulk(b"r-1"),
                ],
            )]),
        ])]);

        let entries = parse_read_reply(reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stream, "client-out");
        assert_eq!(entries[0].id, "1-0");
        let names: Vec<&str> = entries[0].message.fields().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["symbol", "type", "request_id"]);
    }

    #[test]
    fn invalid_utf8_stays_inside_its_field() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk(b"updater-out"),
            Value::Array(vec![
                entry("1-0", vec![bulk(&[0xff, b'x']), bulk(&[0xfe]), bulk(b"type"), bulk(b"DATA_FETCHED")]),
                entry("2-0", vec![bulk(b"type"), bulk(b"DATA_FETCHED")]),
            ]),
        ])]);

        let entries = parse_read_reply(reply).unwrap();
        assert_eq!(entries.len(), 2);
        let fields = entries[0].message.fields();
        assert_eq!(fields[0], ("\u{fffd}x".to_string(), vec![0xfe]));
        assert_eq!(entries[0].message.get_text("type").as_deref(), Some("DATA_FETCHED"));
    }

    #[test]
    fn deleted_pending_entry_has_no_fields() {
        let reply = Value::Map(vec![(
            bulk(b"client-out"),
            Value::Array(vec![Value::Array(vec![bulk(b"3-0"), Value::Nil])]),
        )]);

        let entries = parse_read_reply(reply).unwrap();
        assert_eq!(entries[0].id, "3-0");
        assert!(entries[0].message.is_empty());
    }

    #[test]
    fn non_scalar_values_are_skipped() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk(b"client-out"),
            Value::Array(vec![entry(
                "4-0",
                vec![bulk(b"nested"), Value::Array(vec![]), bulk(b"n"), Value::Int(7)],
            )]),
        ])]);

        let entries = parse_read_reply(reply).unwrap();
        assert_eq!(entries[0].message.fields(), &[("n".to_string(), b"7".to_vec())]);
    }
}
