use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtoError;
use crate::msg_id::MsgId;

/// Envelope header. Exactly these three fields must be present on the wire;
/// `sender`/`receiver` are `null` for relay-originated/relay-terminated
/// messages respectively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub msg_id: MsgId,
}

/// A wire envelope: header plus a free-form payload object.
///
/// Payload schemas are per message id and validated by the consumer; the
/// codec only enforces the envelope shape itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(msg_id: MsgId, sender: Option<String>, receiver: Option<String>) -> Self {
        Self {
            header: Header {
                sender,
                receiver,
                msg_id,
            },
            payload: Map::new(),
        }
    }

    /// Fetch a payload field as a string slice.
    pub fn payload_str(&self, field: &str) -> Result<&str, ProtoError> {
        self.payload
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| ProtoError::MissingField(field.to_string()))
    }

    /// Fetch a payload field as an unsigned integer.
    pub fn payload_u64(&self, field: &str) -> Result<u64, ProtoError> {
        self.payload
            .get(field)
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtoError::MissingField(field.to_string()))
    }

    /// Fetch a raw payload field.
    pub fn payload_value(&self, field: &str) -> Result<&Value, ProtoError> {
        self.payload
            .get(field)
            .ok_or_else(|| ProtoError::MissingField(field.to_string()))
    }

    /// Overwrite a payload field in place.
    pub fn set_payload(&mut self, field: &str, value: Value) {
        self.payload.insert(field.to_string(), value);
    }
}

/// Serialize an envelope to its wire form.
pub fn serialize(envelope: &Envelope) -> String {
    // Envelope contains only JSON-representable types; encoding cannot fail.
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Deserialize and validate a wire frame.
///
/// JSON syntax errors are reported as [`ProtoError::Deserialization`]; shape
/// violations (missing/extra/mistyped envelope fields) as
/// [`ProtoError::Malformed`]. The relay treats both as fatal for the
/// connection.
pub fn deserialize(serial: &str) -> Result<Envelope, ProtoError> {
    let pretender: Value = serde_json::from_str(serial)
        .map_err(|e| ProtoError::Deserialization(e.to_string()))?;

    let object = pretender
        .as_object()
        .ok_or_else(|| ProtoError::Malformed("top level is not an object".into()))?;

    for field in object.keys() {
        if field != "header" && field != "payload" {
            return Err(ProtoError::Malformed(format!("unexpected field: {field}")));
        }
    }

    let header = object
        .get("header")
        .and_then(Value::as_object)
        .ok_or_else(|| ProtoError::Malformed("no valid header".into()))?;

    for field in header.keys() {
        if field != "sender" && field != "receiver" && field != "msg_id" {
            return Err(ProtoError::Malformed(format!(
                "unexpected header field: {field}"
            )));
        }
    }
    for expected in ["sender", "receiver", "msg_id"] {
        if !header.contains_key(expected) {
            return Err(ProtoError::Malformed(format!(
                "header field missing: {expected}"
            )));
        }
    }

    let sender = address_field(header, "sender")?;
    let receiver = address_field(header, "receiver")?;

    let msg_id = header
        .get("msg_id")
        .and_then(Value::as_u64)
        .and_then(|raw| u16::try_from(raw).ok())
        .ok_or_else(|| ProtoError::Malformed("msg_id is not a valid integer".into()))?;
    let msg_id = MsgId::try_from(msg_id)?;

    let payload = match object.get("payload") {
        Some(Value::Object(map)) => map.clone(),
        None => return Err(ProtoError::Malformed("payload missing".into())),
        Some(_) => return Err(ProtoError::Malformed("payload is not an object".into())),
    };

    Ok(Envelope {
        header: Header {
            sender,
            receiver,
            msg_id,
        },
        payload,
    })
}

/// Extract a header address field: must be a string or null.
fn address_field(
    header: &Map<String, Value>,
    field: &str,
) -> Result<Option<String>, ProtoError> {
    match header.get(field) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(ProtoError::Malformed(format!(
            "header field {field} is mistyped"
        ))),
    }
}
