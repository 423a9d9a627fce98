use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Number, Value};
use thiserror::Error;

const MESSAGES_KEY: &str = "Messages";
const MESSAGE_ID_KEY: &str = "MessageId";
const TRANSPORT_DATA_KEY: &str = "TransportData";

/// Envelope decoding failures.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is a non-empty array, expected an object")]
    NotAnObject,

    #[error("envelope carries Messages without a MessageId")]
    MissingMessageId,

    #[error("MessageId is not an integer: {0}")]
    InvalidMessageId(Value),

    #[error("group name is not a string: {0}")]
    InvalidGroup(Value),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransportDataMsg {
    #[serde(rename = "Groups", default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TransportDataMsg {
    /// Group names carried by the envelope, if any.
    ///
    /// `Groups` must be an array; numbers and booleans in it are taken by
    /// their textual form. A `null` list counts as absent.
    pub fn group_names(&self) -> Result<Option<Vec<String>>, EnvelopeError> {
        let groups = match self.groups.as_ref() {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Array(groups)) => groups,
            Some(other) => return Err(EnvelopeError::InvalidGroup(other.clone())),
        };
        groups
            .iter()
            .map(|group| match group {
                Value::String(name) => Ok(name.clone()),
                Value::Number(number) => Ok(number.to_string()),
                Value::Bool(flag) => Ok(flag.to_string()),
                other => Err(EnvelopeError::InvalidGroup(other.clone())),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// Application envelope decoded from one inbound frame.
///
/// Every field is optional, and a field of the wrong JSON type is treated
/// as absent. Messages are kept as the raw text the server sent. Unknown
/// top-level fields are kept in `extra`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Envelope {
    #[serde(rename = "Messages", skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Box<RawValue>>>,
    #[serde(rename = "MessageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Value>,
    #[serde(rename = "TransportData", skip_serializing_if = "Option::is_none")]
    pub transport_data: Option<TransportDataMsg>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Box<RawValue>>,
}

impl Envelope {
    /// Decodes a frame.
    ///
    /// Returns `Ok(None)` for heartbeat frames: empty objects, empty arrays,
    /// `null`, and JSON scalars.
    pub fn from_text(text: &str) -> Result<Option<Self>, EnvelopeError> {
        let frame: Box<RawValue> = serde_json::from_str(text)?;
        let raw = frame.get().trim_start();
        match raw.as_bytes().first() {
            Some(b'{') => {
                let fields: BTreeMap<String, Box<RawValue>> = serde_json::from_str(raw)?;
                if fields.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Self::from_fields(fields)))
            }
            Some(b'[') => {
                let items: Vec<Box<RawValue>> = serde_json::from_str(raw)?;
                if items.is_empty() {
                    Ok(None)
                } else {
                    Err(EnvelopeError::NotAnObject)
                }
            }
            _ => Ok(None),
        }
    }

    fn from_fields(mut fields: BTreeMap<String, Box<RawValue>>) -> Self {
        let messages = fields
            .remove(MESSAGES_KEY)
            .and_then(|raw| serde_json::from_str::<Vec<Box<RawValue>>>(raw.get()).ok());
        let message_id = fields
            .remove(MESSAGE_ID_KEY)
            .and_then(|raw| serde_json::from_str::<Value>(raw.get()).ok());
        let transport_data = fields
            .remove(TRANSPORT_DATA_KEY)
            .and_then(|raw| serde_json::from_str::<TransportDataMsg>(raw.get()).ok());
        Self {
            messages,
            message_id,
            transport_data,
            extra: fields,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Cursor carried by the envelope.
    ///
    /// Accepts an integer, a whole-valued float, or a string holding an
    /// integer.
    pub fn cursor(&self) -> Result<i64, EnvelopeError> {
        match self.message_id.as_ref() {
            None | Some(Value::Null) => Err(EnvelopeError::MissingMessageId),
            Some(Value::Number(number)) => number
                .as_i64()
                .or_else(|| whole_number(number))
                .ok_or_else(|| EnvelopeError::InvalidMessageId(Value::Number(number.clone()))),
            Some(Value::String(text)) => text
                .trim()
                .parse()
                .map_err(|_| EnvelopeError::InvalidMessageId(Value::String(text.clone()))),
            Some(other) => Err(EnvelopeError::InvalidMessageId(other.clone())),
        }
    }

    /// Replacement group list, if the envelope carries one.
    pub fn groups(&self) -> Result<Option<Vec<String>>, EnvelopeError> {
        match self.transport_data.as_ref() {
            Some(transport_data) => transport_data.group_names(),
            None => Ok(None),
        }
    }
}

fn whole_number(number: &Number) -> Option<i64> {
    let value = number.as_f64()?;
    let fits = value >= i64::MIN as f64 && value < i64::MAX as f64;
    (value.fract() == 0.0 && fits).then_some(value as i64)
}

/// Text handed to the receive callback for one batched message.
///
/// Strings are delivered unescaped without quotes; everything else exactly
/// as the server encoded it.
pub fn message_text(message: &RawValue) -> String {
    let raw = message.get();
    if raw.starts_with('"') {
        if let Ok(text) = serde_json::from_str::<String>(raw) {
            return text;
        }
    }
    raw.to_string()
}
