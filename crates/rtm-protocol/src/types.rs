//! Wire-format envelopes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DispatchError;

/// Client-selected flow control for one message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowControlMode {
    /// Enqueue and return immediately.
    #[default]
    Default,
    /// Wait (bounded) for previously submitted work before enqueueing.
    WaitPending,
}

/// A decoded inbound message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    /// Message type; key into the handler and authorizer registries.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Client-chosen id, echoed as `replyTo` on responses.
    pub id: String,
    /// Flow-control mode.
    #[serde(default)]
    pub mode: FlowControlMode,
    /// Requested `WAIT_PENDING` wait in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
    /// Client-supplied trace id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Type-specific fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ReceivedMessage {
    /// Decode a text frame.
    ///
    /// The error references the original `id` whenever the frame is a JSON
    /// object carrying a string `id`, even if the rest of the envelope is
    /// invalid.
    pub fn decode(text: &str) -> Result<Self, (Option<String>, DispatchError)> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            (
                None,
                DispatchError::Deserialization {
                    message: format!("Invalid JSON: {e}"),
                },
            )
        })?;

        let Some(object) = value.as_object() else {
            return Err((
                None,
                DispatchError::Deserialization {
                    message: "Message must be a JSON object".into(),
                },
            ));
        };
        let reply_to = object.get("id").and_then(Value::as_str).map(str::to_owned);

        let message: Self = serde_json::from_value(value).map_err(|e| {
            (
                reply_to.clone(),
                DispatchError::Deserialization {
                    message: format!("Invalid message envelope: {e}"),
                },
            )
        })?;

        if message.message_type.trim().is_empty() {
            return Err((
                reply_to,
                DispatchError::Deserialization {
                    message: "Message type must not be empty".into(),
                },
            ));
        }
        Ok(message)
    }

    /// A payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// A payload field as a string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }

    /// Effective `WAIT_PENDING` duration: the requested wait (or `default`),
    /// clamped to `max`.
    pub fn wait_duration(&self, default: Duration, max: Duration) -> Duration {
        self.wait_ms
            .map_or(default, Duration::from_millis)
            .min(max)
    }
}

/// Server-originated envelopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEnvelope {
    /// First frame on every accepted connection.
    #[serde(rename_all = "camelCase")]
    Hello {
        /// Generated connection id.
        client_id: String,
    },
    /// Failure correlated to an inbound message.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Id of the originating message, when known.
        reply_to: Option<String>,
        /// Numeric status (see [`crate::status`]).
        status: u16,
        /// Human-readable message.
        message: String,
    },
    /// Unsolicited notice preceding a forced close during shutdown.
    Shutdown {
        /// Reason shown to the client.
        message: String,
    },
    /// Topic event fanned out to subscribers.
    Event {
        /// Topic name.
        topic: String,
        /// Event payload.
        data: Value,
    },
}

impl OutboundEnvelope {
    /// Build an error envelope.
    pub fn error(reply_to: Option<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Error {
            reply_to,
            status,
            message: message.into(),
        }
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Build a handler reply: `{"type": message_type, "replyTo": reply_to, ...body}`.
///
/// `body` fields are merged in when it is an object; any other value is
/// placed under `data`. `type` and `replyTo` always win over body fields.
pub fn reply(message_type: &str, reply_to: &str, body: Value) -> Value {
    let mut map = match body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            let _ = map.insert("data".into(), other);
            map
        }
    };
    let _ = map.insert("type".into(), Value::String(message_type.to_owned()));
    let _ = map.insert("replyTo".into(), Value::String(reply_to.to_owned()));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_minimal_message() {
        let msg = ReceivedMessage::decode(r#"{"type":"foo.bar","id":"1"}"#).unwrap();
        assert_eq!(msg.message_type, "foo.bar");
        assert_eq!(msg.id, "1");
        assert_eq!(msg.mode, FlowControlMode::Default);
        assert!(msg.wait_ms.is_none());
        assert!(msg.trace_id.is_none());
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn decode_wait_pending_with_payload() {
        let msg = ReceivedMessage::decode(
            r#"{"type":"subscribe","id":"7","mode":"WAIT_PENDING","waitMs":250,"traceId":"t-1","topic":"grades"}"#,
        )
        .unwrap();
        assert_eq!(msg.mode, FlowControlMode::WaitPending);
        assert_eq!(msg.wait_ms, Some(250));
        assert_eq!(msg.trace_id.as_deref(), Some("t-1"));
        assert_eq!(msg.str_field("topic"), Some("grades"));
        assert!(msg.field("mode").is_none());
    }

    #[test]
    fn decode_invalid_json_has_no_reply_to() {
        let (reply_to, err) = ReceivedMessage::decode("not json").unwrap_err();
        assert!(reply_to.is_none());
        assert!(matches!(err, DispatchError::Deserialization { .. }));
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn decode_non_object() {
        let (reply_to, err) = ReceivedMessage::decode("[1,2]").unwrap_err();
        assert!(reply_to.is_none());
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn decode_missing_type_keeps_reply_to() {
        let (reply_to, err) = ReceivedMessage::decode(r#"{"id":"9"}"#).unwrap_err();
        assert_eq!(reply_to.as_deref(), Some("9"));
        assert!(matches!(err, DispatchError::Deserialization { .. }));
    }

    #[test]
    fn decode_unknown_mode_is_rejected() {
        let (reply_to, _) =
            ReceivedMessage::decode(r#"{"type":"a","id":"3","mode":"LATER"}"#).unwrap_err();
        assert_eq!(reply_to.as_deref(), Some("3"));
    }

    #[test]
    fn decode_empty_type_is_rejected() {
        let (reply_to, err) = ReceivedMessage::decode(r#"{"type":" ","id":"4"}"#).unwrap_err();
        assert_eq!(reply_to.as_deref(), Some("4"));
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn wait_duration_defaults_and_clamps() {
        let default = Duration::from_secs(5);
        let max = Duration::from_secs(30);

        let msg = ReceivedMessage::decode(r#"{"type":"a","id":"1"}"#).unwrap();
        assert_eq!(msg.wait_duration(default, max), default);

        let msg = ReceivedMessage::decode(r#"{"type":"a","id":"1","waitMs":100}"#).unwrap();
        assert_eq!(msg.wait_duration(default, max), Duration::from_millis(100));

        let msg = ReceivedMessage::decode(r#"{"type":"a","id":"1","waitMs":999999}"#).unwrap();
        assert_eq!(msg.wait_duration(default, max), max);
    }

    #[test]
    fn hello_wire_format() {
        let json = OutboundEnvelope::Hello {
            client_id: "c1".into(),
        }
        .to_json()
        .unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, json!({"type": "hello", "clientId": "c1"}));
    }

    #[test]
    fn error_wire_format() {
        let json = OutboundEnvelope::error(Some("1".into()), 501, "nope")
            .to_json()
            .unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            v,
            json!({"type": "error", "replyTo": "1", "status": 501, "message": "nope"})
        );
    }

    #[test]
    fn error_without_reply_to_serializes_null() {
        let json = OutboundEnvelope::error(None, 400, "bad").to_json().unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert!(v["replyTo"].is_null());
    }

    #[test]
    fn shutdown_and_event_wire_format() {
        let v: Value = serde_json::from_str(
            &OutboundEnvelope::Shutdown {
                message: "bye".into(),
            }
            .to_json()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(v, json!({"type": "shutdown", "message": "bye"}));

        let v: Value = serde_json::from_str(
            &OutboundEnvelope::Event {
                topic: "grades".into(),
                data: json!({"score": 1}),
            }
            .to_json()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["topic"], "grades");
        assert_eq!(v["data"]["score"], 1);
    }

    #[test]
    fn reply_merges_object_body() {
        let v = reply("pong", "1", json!({"at": 5, "type": "ignored"}));
        assert_eq!(v, json!({"type": "pong", "replyTo": "1", "at": 5}));
    }

    #[test]
    fn reply_wraps_scalar_body() {
        let v = reply("count", "2", json!(3));
        assert_eq!(v["data"], 3);
        assert_eq!(reply("ack", "3", Value::Null), json!({"type": "ack", "replyTo": "3"}));
    }
}
