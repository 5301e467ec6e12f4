//! JSON frame protocol for the subscription channel.
//!
//! Outbound frames (client → server):
//! ```text
//! { "type": "subscribe",   "collection": "tiles", "query": { "filter": {...}, "fields": [...] }, "uid": "tiles:t1" }
//! { "type": "unsubscribe", "uid": "tiles:t1" }
//! { "type": "pong" }
//! ```
//!
//! Inbound frames (server → client):
//! ```text
//! { "type": "subscription", "uid": "tiles:t1", "event": "init"|"create"|"update"|"delete", "data": [...] }
//! { "type": "delete",       "uid": "tiles:t1", "data": ["t1"] }
//! { "type": "error",        "uid"?: "...", "error": { "message": "..." } }
//! { "type": "ping" }
//! ```
//!
//! Inbound text is validated into [`InboundFrame`] here, before the
//! dispatcher sees it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Projection sent with a subscribe frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

impl Query {
    /// Query pinned to a single record id.
    pub fn item(id: &str) -> Self {
        Self {
            filter: Some(eq_filter("id", id)),
            fields: None,
        }
    }

    pub fn filtered(filter: Value) -> Self {
        Self {
            filter: Some(filter),
            fields: None,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// `{ <field>: { "_eq": <value> } }`
pub fn eq_filter(field: &str, value: impl Into<Value>) -> Value {
    let mut filter = serde_json::Map::new();
    filter.insert(field.to_string(), json!({ "_eq": value.into() }));
    Value::Object(filter)
}

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    Subscribe {
        collection: String,
        query: Query,
        uid: String,
    },
    Unsubscribe {
        uid: String,
    },
    Pong,
}

impl OutboundFrame {
    pub fn subscribe(uid: impl Into<String>, collection: impl Into<String>, query: Query) -> Self {
        Self::Subscribe {
            collection: collection.into(),
            query,
            uid: uid.into(),
        }
    }

    pub fn unsubscribe(uid: impl Into<String>) -> Self {
        Self::Unsubscribe { uid: uid.into() }
    }

    pub fn pong() -> Self {
        Self::Pong
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// Change kind carried by a subscription event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Snapshot of the matching records, sent right after subscribing.
    Init,
    Create,
    Update,
    Delete,
}

impl EventKind {
    fn parse(event: &str) -> Option<Self> {
        match event {
            "init" => Some(Self::Init),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A change notification routed to one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub uid: String,
    pub kind: EventKind,
    pub data: Vec<Value>,
}

impl SubscriptionEvent {
    /// Decode every payload entry as `T`. Entries that fail are returned
    /// as errors so the caller can log and skip them individually.
    pub fn records<T: DeserializeOwned>(&self) -> Vec<Result<T, ProtocolError>> {
        self.data
            .iter()
            .map(|entry| {
                T::deserialize(entry).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
            })
            .collect()
    }

    /// Ids named by a delete payload: bare strings or numbers, or objects
    /// with an `id` field.
    pub fn ids(&self) -> Vec<String> {
        self.data.iter().filter_map(value_id).collect()
    }
}

fn value_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        Value::Object(map) => map.get("id").and_then(value_id),
        _ => None,
    }
}

/// Validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event(SubscriptionEvent),
    Ping,
    Pong,
    ErrorNotice { uid: Option<String>, message: String },
    /// Frame types this client does not consume (e.g. `auth` acks).
    Unsupported { kind: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl InboundFrame {
    /// Parse and validate one text frame.
    ///
    /// Text that is not a JSON object with a `type` is
    /// [`ProtocolError::Malformed`]. Well-formed JSON with an unusable
    /// shape is [`ProtocolError::InvalidFrame`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        raw.try_into()
    }
}

impl TryFrom<RawFrame> for InboundFrame {
    type Error = ProtocolError;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "error" => Ok(Self::ErrorNotice {
                uid: raw.uid,
                message: error_message(raw.error.as_ref()),
            }),
            "subscription" | "delete" => {
                if raw.event.as_deref() == Some("error") {
                    return Ok(Self::ErrorNotice {
                        uid: raw.uid,
                        message: error_message(raw.error.as_ref()),
                    });
                }
                let uid = raw
                    .uid
                    .ok_or_else(|| ProtocolError::InvalidFrame("missing uid".into()))?;
                let kind = if raw.kind == "delete" {
                    EventKind::Delete
                } else {
                    let event = raw.event.ok_or_else(|| {
                        ProtocolError::InvalidFrame(format!("missing event for uid {uid}"))
                    })?;
                    EventKind::parse(&event).ok_or_else(|| {
                        ProtocolError::InvalidFrame(format!("unknown event '{event}' for uid {uid}"))
                    })?
                };
                let data = match raw.data {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(single) => vec![single],
                };
                Ok(Self::Event(SubscriptionEvent { uid, kind, data }))
            }
            other => Ok(Self::Unsupported {
                kind: other.to_string(),
            }),
        }
    }
}

fn error_message(error: Option<&Value>) -> String {
    match error {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "unspecified error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = OutboundFrame::subscribe(
            "tiles:t1",
            "tiles",
            Query::item("t1").with_fields(["*", "rafts"]),
        );
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "subscribe",
                "collection": "tiles",
                "query": { "filter": { "id": { "_eq": "t1" } }, "fields": ["*", "rafts"] },
                "uid": "tiles:t1"
            })
        );
    }

    #[test]
    fn test_subscribe_without_projection_omits_keys() {
        let frame = OutboundFrame::subscribe("all", "batches", Query::default());
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["query"], json!({}));
    }

    #[test]
    fn test_unsubscribe_and_pong_shapes() {
        let unsub: Value =
            serde_json::from_str(&OutboundFrame::unsubscribe("x").encode().unwrap()).unwrap();
        assert_eq!(unsub, json!({"type": "unsubscribe", "uid": "x"}));

        let pong: Value = serde_json::from_str(&OutboundFrame::pong().encode().unwrap()).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));
    }

    #[test]
    fn test_decode_subscription_event() {
        let frame = InboundFrame::decode(
            r#"{"type":"subscription","uid":"tiles:t1","event":"update","data":[{"id":"t1"}]}"#,
        )
        .unwrap();

        match frame {
            InboundFrame::Event(event) => {
                assert_eq!(event.uid, "tiles:t1");
                assert_eq!(event.kind, EventKind::Update);
                assert_eq!(event.data.len(), 1);
            }
            other => panic!("Expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_delete_type_is_delete_event() {
        let frame = InboundFrame::decode(r#"{"type":"delete","uid":"rafts:r1","data":["r1"]}"#).unwrap();
        match frame {
            InboundFrame::Event(event) => {
                assert_eq!(event.kind, EventKind::Delete);
                assert_eq!(event.ids(), vec!["r1".to_string()]);
            }
            other => panic!("Expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_ping_and_unsupported() {
        assert_eq!(InboundFrame::decode(r#"{"type":"ping"}"#).unwrap(), InboundFrame::Ping);
        assert_eq!(
            InboundFrame::decode(r#"{"type":"auth","status":"ok"}"#).unwrap(),
            InboundFrame::Unsupported { kind: "auth".into() }
        );
    }

    #[test]
    fn test_decode_error_frames() {
        let plain = InboundFrame::decode(r#"{"type":"error","error":{"code":"FORBIDDEN","message":"nope"}}"#)
            .unwrap();
        assert_eq!(
            plain,
            InboundFrame::ErrorNotice { uid: None, message: "nope".into() }
        );

        let scoped = InboundFrame::decode(
            r#"{"type":"subscription","uid":"u1","event":"error","error":"bad filter"}"#,
        )
        .unwrap();
        assert_eq!(
            scoped,
            InboundFrame::ErrorNotice { uid: Some("u1".into()), message: "bad filter".into() }
        );
    }

    #[test]
    fn test_decode_malformed_json() {
        let result = InboundFrame::decode("{not json");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_missing_uid_is_invalid() {
        let result = InboundFrame::decode(r#"{"type":"subscription","event":"create","data":[]}"#);
        assert!(matches!(result, Err(ProtocolError::InvalidFrame(_))));
    }

    #[test]
    fn test_decode_unknown_event_is_invalid() {
        let result = InboundFrame::decode(r#"{"type":"subscription","uid":"u","event":"merge"}"#);
        assert!(matches!(result, Err(ProtocolError::InvalidFrame(_))));
    }

    #[test]
    fn test_single_object_data_is_wrapped() {
        let frame =
            InboundFrame::decode(r#"{"type":"subscription","uid":"u","event":"create","data":{"id":"x"}}"#)
                .unwrap();
        match frame {
            InboundFrame::Event(event) => assert_eq!(event.data, vec![json!({"id": "x"})]),
            other => panic!("Expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_ids_accept_mixed_forms() {
        let event = SubscriptionEvent {
            uid: "u".into(),
            kind: EventKind::Delete,
            data: vec![json!("a"), json!(7), json!({"id": "c"}), json!(null)],
        };
        assert_eq!(event.ids(), vec!["a".to_string(), "7".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_records_decode_per_entry() {
        #[derive(Debug, Deserialize)]
        struct Item {
            id: String,
        }
        let event = SubscriptionEvent {
            uid: "u".into(),
            kind: EventKind::Create,
            data: vec![json!({"id": "ok"}), json!({"nope": 1})],
        };
        let decoded = event.records::<Item>();
        assert_eq!(decoded[0].as_ref().unwrap().id, "ok");
        assert!(decoded[1].is_err());
    }
}
