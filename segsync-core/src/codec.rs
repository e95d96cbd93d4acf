//! Codec for segsync frames
//!
//! Outbound frames are plain JSON objects built from [`RequestFrame`].
//! Inbound frames are classified by their `type` field into
//! [`InboundFrame`] variants. Classification is strict about the shape of a
//! response (it must carry a `request_id`) and lenient about everything
//! else: unknown types become [`InboundFrame::Other`] so the caller can log
//! and drop them.
//!
//! # Examples
//!
//! ```rust
//! use segsync_core::{codec, InboundFrame};
//!
//! let frame = codec::decode(r#"{"type":"api-company_updated","data":{"id":1}}"#).unwrap();
//! match frame {
//!     InboundFrame::Push(push) => assert_eq!(push.topic, "api-company_updated"),
//!     other => panic!("unexpected frame: {other:?}"),
//! }
//! ```

use crate::error::{Error, Result};
use crate::types::{InboundFrame, PushFrame, RequestFrame, ResponseFrame, LEGACY_EVENT_PUSH, PUSH_PREFIX};
use serde::Serialize;
use serde_json::Value;

/// Encode any serializable frame to a JSON string
pub fn encode<T: Serialize>(msg: &T) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode an outbound request
///
/// ```rust
/// use segsync_core::{codec, RequestFrame, RequestKind};
///
/// let frame = RequestFrame::new(&RequestKind::Ping, "ping_1".into());
/// let json = codec::encode_request(&frame).unwrap();
/// assert!(json.contains("\"type\":\"ping\""));
/// ```
pub fn encode_request(frame: &RequestFrame) -> Result<String> {
    encode(frame)
}

/// Whether a frame type denotes a push notification
pub fn is_push_type(kind: &str) -> bool {
    kind.starts_with(PUSH_PREFIX) || kind == LEGACY_EVENT_PUSH
}

/// Decode and classify one inbound text frame
///
/// # Errors
///
/// Returns `Error::Serialization` when the text is not JSON, is not an
/// object, or is a `response` whose fields do not deserialize.
pub fn decode(data: &str) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(data)?;
    classify(value)
}

/// Classify an already-parsed frame
pub fn classify(value: Value) -> Result<InboundFrame> {
    let Value::Object(mut obj) = value else {
        return Err(Error::Serialization("frame is not a JSON object".into()));
    };

    let kind = match obj.get("type") {
        Some(Value::String(s)) => s.clone(),
        _ => return Ok(InboundFrame::Other { kind: None }),
    };

    match kind.as_str() {
        "response" => {
            if !obj.contains_key("request_id") {
                return Ok(InboundFrame::Other { kind: Some(kind) });
            }
            let response: ResponseFrame = serde_json::from_value(Value::Object(obj))?;
            Ok(InboundFrame::Response(response))
        }
        "error" => {
            let message = obj
                .get("message")
                .or_else(|| obj.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown server error")
                .to_string();
            Ok(InboundFrame::Error { message })
        }
        "pong" => Ok(InboundFrame::Pong),
        _ if is_push_type(&kind) => {
            let data = obj.remove("data");
            Ok(InboundFrame::Push(PushFrame { topic: kind, data }))
        }
        _ => Ok(InboundFrame::Other { kind: Some(kind) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestKind;
    use serde_json::json;

    #[test]
    fn test_encode_request_with_fields() {
        let frame = RequestFrame::new(&RequestKind::City, "get_city_1".into())
            .with_field("city_id", json!(4));
        let encoded = encode_request(&frame).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "get-city");
        assert_eq!(value["request_id"], "get_city_1");
        assert_eq!(value["city_id"], 4);
    }

    #[test]
    fn test_decode_response() {
        let frame = decode(r#"{"type":"response","request_id":"r1","data":[1,2]}"#).unwrap();
        match frame {
            InboundFrame::Response(resp) => {
                assert_eq!(resp.request_id.as_str(), "r1");
                assert_eq!(resp.data, Some(json!([1, 2])));
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_with_error() {
        let frame = decode(r#"{"type":"response","request_id":"r2","error":"nope"}"#).unwrap();
        let InboundFrame::Response(resp) = frame else {
            panic!("expected response");
        };
        assert_eq!(resp.error.as_deref(), Some("nope"));
        assert!(resp.data.is_none());
    }

    #[test]
    fn test_response_without_id_is_other() {
        let frame = decode(r#"{"type":"response","data":{}}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Other {
                kind: Some("response".into())
            }
        );
    }

    #[test]
    fn test_decode_push_variants() {
        let frame = decode(r#"{"type":"api-update_session_stage","data":{"new_stage":"End"}}"#)
            .unwrap();
        let InboundFrame::Push(push) = frame else {
            panic!("expected push");
        };
        assert_eq!(push.topic, "api-update_session_stage");
        assert_eq!(push.field("new_stage"), Some(&json!("End")));

        let legacy = decode(r#"{"type":"event_update"}"#).unwrap();
        assert_eq!(
            legacy,
            InboundFrame::Push(PushFrame::new("event_update", None))
        );
    }

    #[test]
    fn test_decode_error_and_pong() {
        assert_eq!(
            decode(r#"{"type":"error","message":"bad"}"#).unwrap(),
            InboundFrame::Error {
                message: "bad".into()
            }
        );
        assert_eq!(decode(r#"{"type":"pong"}"#).unwrap(), InboundFrame::Pong);
    }

    #[test]
    fn test_decode_unknown_and_untyped() {
        assert_eq!(
            decode(r#"{"type":"welcome"}"#).unwrap(),
            InboundFrame::Other {
                kind: Some("welcome".into())
            }
        );
        assert_eq!(
            decode(r#"{"hello":1}"#).unwrap(),
            InboundFrame::Other { kind: None }
        );
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(matches!(decode("not json"), Err(Error::Serialization(_))));
        assert!(matches!(decode("[1,2,3]"), Err(Error::Serialization(_))));
        assert!(matches!(decode(""), Err(Error::Serialization(_))));
    }
}
