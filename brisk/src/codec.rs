//! Message codecs
//!
//! Exactly one codec is active per server, chosen from
//! [`Encoding`](crate::config::Encoding) when the server is built.

use std::sync::Arc;

use crate::config::Encoding;
use crate::error::CodecError;
use crate::message::Message;
use crate::transport::Frame;

/// Converts between wire bytes and [`Message`]s
pub trait Codec: Send + Sync {
    /// Decode the payload of a data frame
    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError>;

    /// Encode a message into a data frame
    fn encode(&self, message: &Message) -> Result<Frame, CodecError>;
}

/// JSON over text frames
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode(&self, message: &Message) -> Result<Frame, CodecError> {
        serde_json::to_string(message)
            .map(Frame::Text)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

/// Codec for the configured encoding
///
/// Fails for encodings without an implementation so the server refuses to
/// start instead of failing on the first message.
pub fn codec_for(encoding: Encoding) -> Result<Arc<dyn Codec>, CodecError> {
    match encoding {
        Encoding::Json => Ok(Arc::new(JsonCodec)),
        Encoding::MsgPack => Err(CodecError::Unsupported(encoding.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let message = Message::new("chat")
            .with("text", "hello")
            .with("tags", json!(["a", "b"]))
            .with("nested", json!({ "n": 1.5, "ok": true, "none": null }));

        let frame = codec.encode(&message).unwrap();
        let decoded = codec.decode(frame.data().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        let codec = JsonCodec;
        assert!(matches!(codec.decode(b"{not json"), Err(CodecError::Decode(_))));
        assert!(matches!(codec.decode(br#"{"payload":{}}"#), Err(CodecError::Decode(_))));
        assert!(matches!(codec.decode(br#"{"event":"x","payload":[1]}"#), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_msg_pack_fails_fast() {
        assert!(codec_for(Encoding::Json).is_ok());
        assert!(matches!(
            codec_for(Encoding::MsgPack),
            Err(CodecError::Unsupported(name)) if name == "msg_pack"
        ));
    }
}
