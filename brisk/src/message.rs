//! Application message shape
//!
//! Every frame exchanged with a client carries one [`Message`]:
//!
//! ```json
//! { "event": "chat", "payload": { "text": "hi" } }
//! ```
//!
//! The server synthesizes three events of its own: `error`, `ack` and
//! `reply`, each with a numeric `code` and a human-readable `message`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event name of server-generated error messages
pub const EVENT_ERROR: &str = "error";
/// Event name of acknowledgements
pub const EVENT_ACK: &str = "ack";
/// Event name of generic replies
pub const EVENT_REPLY: &str = "reply";

/// A structured application message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Event discriminator
    pub event: String,

    /// Arbitrary event data
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Message {
    /// Create a message with an empty payload
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Error message, e.g. `error(400, "could not decode message")`
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::status(EVENT_ERROR, code, message)
    }

    /// Acknowledgement of an accepted message
    #[must_use]
    pub fn ack(code: u16, message: impl Into<String>) -> Self {
        Self::status(EVENT_ACK, code, message)
    }

    /// Generic reply
    #[must_use]
    pub fn reply(code: u16, message: impl Into<String>) -> Self {
        Self::status(EVENT_REPLY, code, message)
    }

    fn status(event: &str, code: u16, message: impl Into<String>) -> Self {
        Self::new(event)
            .with("code", code)
            .with("message", message.into())
    }

    /// String field of the payload, if present
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Numeric `code` of a system message
    #[must_use]
    pub fn code(&self) -> Option<u64> {
        self.payload.get("code").and_then(Value::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_shape() {
        let msg = Message::error(401, "could not authenticate client");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "error",
                "payload": { "code": 401, "message": "could not authenticate client" }
            })
        );
    }

    #[test]
    fn test_missing_payload_defaults_to_empty() {
        let msg: Message = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(msg, Message::new("ping"));
    }

    #[test]
    fn test_payload_accessors() {
        let msg = Message::new("auth").with("group", "a").with("n", 3);
        assert_eq!(msg.payload_str("group"), Some("a"));
        assert_eq!(msg.payload_str("n"), None);
        assert_eq!(Message::ack(200, "ok").code(), Some(200));
    }
}
