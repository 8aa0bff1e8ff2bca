//! Wire format for stream entries.
//!
//! Every stream field is a byte string. Structured values travel as JSON
//! text, everything else as plain text. Decoding is done field by field so a
//! single malformed field never poisons the rest of the entry.

use serde_json::{Map, Value};
use std::fmt;

use crate::error::DecodeError;

/// A document or payload: field name to JSON value, insertion ordered.
pub type Document = Map<String, Value>;

pub const TYPE_FIELD: &str = "type";
pub const REQUEST_ID_FIELD: &str = "request_id";
pub const SORT_KEY_FIELD: &str = "sortkey";
const SORT_KEY_ALIAS: &str = "sortKey";
/// Document field holding the parameters the stored data was fetched for.
pub const PARAMS_FIELD: &str = "params";

/// Raw stream entry fields as transmitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMessage {
    fields: Vec<(String, Vec<u8>)>,
}

impl StreamMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.fields.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Field value as text, replacing invalid UTF-8.
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn fields(&self) -> &[(String, Vec<u8>)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for StreamMessage
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    DataFetched,
    DataRequested,
    DataStored,
    DataRead,
    FetchRequest,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::DataFetched => "DATA_FETCHED",
            MessageType::DataRequested => "DATA_REQUESTED",
            MessageType::DataStored => "DATA_STORED",
            MessageType::DataRead => "DATA_READ",
            MessageType::FetchRequest => "FETCH_REQUEST",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s.trim() {
            "DATA_FETCHED" => Some(MessageType::DataFetched),
            "DATA_REQUESTED" => Some(MessageType::DataRequested),
            "DATA_STORED" => Some(MessageType::DataStored),
            "DATA_READ" => Some(MessageType::DataRead),
            "FETCH_REQUEST" => Some(MessageType::FetchRequest),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope fields split from the business payload.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedMessage {
    pub message_type: MessageType,
    pub request_id: String,
    pub payload: Document,
}

/// Decodes one field value: JSON when it parses, plain text otherwise.
pub fn decode_value(raw: &[u8]) -> Value {
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

/// Decodes every field of the entry. Never fails.
pub fn decode_fields(raw: &StreamMessage) -> Document {
    raw.fields()
        .iter()
        .map(|(key, value)| (key.clone(), decode_value(value)))
        .collect()
}

/// Decodes an entry and strips `type` and `request_id` out of the payload.
///
/// Both envelope fields are read as raw text so the correlation id comes
/// back byte-for-byte, even when it happens to look like a number.
pub fn decode(raw: &StreamMessage) -> Result<DecodedMessage, DecodeError> {
    let type_text = raw
        .get_text(TYPE_FIELD)
        .ok_or(DecodeError::MissingField(TYPE_FIELD))?;
    let request_id = raw
        .get_text(REQUEST_ID_FIELD)
        .ok_or(DecodeError::MissingField(REQUEST_ID_FIELD))?;
    let message_type =
        MessageType::from_wire(&type_text).ok_or(DecodeError::UnknownType(type_text))?;

    let mut payload = decode_fields(raw);
    payload.shift_remove(TYPE_FIELD);
    payload.shift_remove(REQUEST_ID_FIELD);

    Ok(DecodedMessage {
        message_type,
        request_id,
        payload,
    })
}

/// Stringifies one payload value for the wire.
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds a stream entry from a payload.
///
/// Only object payloads are encoded; a list (or scalar) payload yields
/// `None` and the caller must treat the message as dropped.
pub fn encode(message_type: MessageType, request_id: &str, payload: &Value) -> Option<StreamMessage> {
    let Value::Object(fields) = payload else {
        return None;
    };

    let mut message: StreamMessage = fields
        .iter()
        .filter(|(k, _)| k.as_str() != TYPE_FIELD && k.as_str() != REQUEST_ID_FIELD)
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect();
    message.push(TYPE_FIELD, message_type.as_str());
    message.push(REQUEST_ID_FIELD, request_id);
    Some(message)
}

/// Parameters of a store read.
///
/// `filter` is every business field except the sort key; a document matches
/// when its `params` field equals it.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadParams {
    pub sort_key: String,
    pub filter: Document,
    /// The business payload exactly as received, sort key included.
    pub payload: Document,
}

impl ReadParams {
    pub fn new(sort_key: impl Into<String>, payload: Document) -> Self {
        let mut filter = payload.clone();
        filter.shift_remove(SORT_KEY_FIELD);
        filter.shift_remove(SORT_KEY_ALIAS);
        Self {
            sort_key: sort_key.into(),
            filter,
            payload,
        }
    }

    /// The business payload the request arrived with, unchanged.
    pub fn to_payload(&self) -> Document {
        self.payload.clone()
    }
}

/// A request this service acts on.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    DataFetched { request_id: String, document: Document },
    DataRequested { request_id: String, params: ReadParams },
}

impl Request {
    pub fn request_id(&self) -> &str {
        match self {
            Request::DataFetched { request_id, .. } | Request::DataRequested { request_id, .. } => {
                request_id
            }
        }
    }
}

impl TryFrom<DecodedMessage> for Request {
    type Error = DecodeError;

    fn try_from(message: DecodedMessage) -> Result<Self, Self::Error> {
        let DecodedMessage {
            message_type,
            request_id,
            payload,
        } = message;

        match message_type {
            MessageType::DataFetched => Ok(Request::DataFetched {
                request_id,
                document: payload,
            }),
            MessageType::DataRequested => {
                let sort_key = match payload
                    .get(SORT_KEY_FIELD)
                    .or_else(|| payload.get(SORT_KEY_ALIAS))
                    .ok_or(DecodeError::MissingField(SORT_KEY_FIELD))?
                {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok(Request::DataRequested {
                    request_id,
                    params: ReadParams::new(sort_key, payload),
                })
            }
            other => Err(DecodeError::Unsupported(other.to_string())),
        }
    }
}
