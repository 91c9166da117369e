//! OCPP 1.6 array framing
//!
//! A message is a JSON array whose first element is the message type:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde_json::Value;

use super::envelope::{Call, CallError, CallResult, Envelope, ErrorCode, FrameError};
use super::ProtocolCodec;

const MSG_CALL: i64 = 2;
const MSG_CALL_RESULT: i64 = 3;
const MSG_CALL_ERROR: i64 = 4;

/// Codec for the array-based framing
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayCodec;

impl ArrayCodec {
    fn correlation_id(array: &[Value]) -> Result<String, FrameError> {
        array
            .get(1)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FrameError::malformed("message id is not a string"))
    }
}

impl ProtocolCodec for ArrayCodec {
    fn decode(&self, text: &str) -> Result<Envelope, FrameError> {
        let array: Vec<Value> = serde_json::from_str(text)?;

        if array.len() < 3 {
            return Err(FrameError::malformed("array has fewer than 3 elements"));
        }

        let msg_type = array[0]
            .as_i64()
            .ok_or_else(|| FrameError::malformed("message type is not an integer"))?;

        match msg_type {
            MSG_CALL => {
                if array.len() != 4 {
                    return Err(FrameError::malformed("CALL must have 4 elements"));
                }
                let id = Self::correlation_id(&array)?;
                let action = array[2]
                    .as_str()
                    .ok_or_else(|| FrameError::malformed("action is not a string"))?
                    .to_string();

                Ok(Envelope::Call(Call {
                    id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            MSG_CALL_RESULT => {
                if array.len() != 3 {
                    return Err(FrameError::malformed("CALLRESULT must have 3 elements"));
                }
                let id = Self::correlation_id(&array)?;

                Ok(Envelope::Result(CallResult {
                    id,
                    payload: array[2].clone(),
                }))
            }
            MSG_CALL_ERROR => {
                if array.len() != 5 {
                    return Err(FrameError::malformed("CALLERROR must have 5 elements"));
                }
                let id = Self::correlation_id(&array)?;
                let code = array[2]
                    .as_str()
                    .map(ErrorCode::from_name)
                    .ok_or_else(|| FrameError::malformed("error code is not a string"))?;
                let description = array[3].as_str().unwrap_or_default().to_string();

                Ok(Envelope::Error(CallError {
                    id,
                    code,
                    description,
                    details: array[4].clone(),
                }))
            }
            other => Err(FrameError::malformed(format!(
                "unknown message type {other}"
            ))),
        }
    }

    fn encode(&self, envelope: &Envelope) -> Result<String, FrameError> {
        let array = match envelope {
            Envelope::Call(c) => {
                serde_json::json!([MSG_CALL, c.id, c.action, c.payload])
            }
            Envelope::Result(r) => {
                serde_json::json!([MSG_CALL_RESULT, r.id, r.payload])
            }
            Envelope::Error(e) => serde_json::json!([
                MSG_CALL_ERROR,
                e.id,
                e.code.name(),
                e.description,
                e.details
            ]),
        };
        Ok(serde_json::to_string(&array)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_call() {
        let codec = ArrayCodec;
        let msg = codec.decode(r#"[2, "msg-123", "Heartbeat", {}]"#).unwrap();

        match msg {
            Envelope::Call(call) => {
                assert_eq!(call.id, "msg-123");
                assert_eq!(call.action, "Heartbeat");
                assert_eq!(call.payload, json!({}));
            }
            _ => panic!("expected CALL"),
        }
    }

    #[test]
    fn decode_call_result() {
        let codec = ArrayCodec;
        let msg = codec
            .decode(r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#)
            .unwrap();

        match msg {
            Envelope::Result(result) => {
                assert_eq!(result.id, "msg-123");
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("expected CALLRESULT"),
        }
    }

    #[test]
    fn decode_call_error() {
        let codec = ArrayCodec;
        let msg = codec
            .decode(r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#)
            .unwrap();

        match msg {
            Envelope::Error(error) => {
                assert_eq!(error.id, "msg-123");
                assert_eq!(error.code, ErrorCode::NotImplemented);
                assert_eq!(error.description, "Action not supported");
            }
            _ => panic!("expected CALLERROR"),
        }
    }

    #[test]
    fn short_array_is_malformed() {
        let codec = ArrayCodec;
        assert!(matches!(
            codec.decode(r#"[2, "id"]"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_message_type_is_malformed() {
        let codec = ArrayCodec;
        assert!(matches!(
            codec.decode(r#"[7, "id", "x"]"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn non_string_id_is_malformed() {
        let codec = ArrayCodec;
        assert!(matches!(
            codec.decode(r#"[3, 42, {}]"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn round_trip_all_variants() {
        let codec = ArrayCodec;
        let envelopes = [
            Envelope::Call(Call {
                id: "m1".into(),
                action: "Heartbeat".into(),
                payload: json!({}),
            }),
            Envelope::Result(CallResult {
                id: "m1".into(),
                payload: json!({"currentTime": "2026-01-20T12:00:00Z"}),
            }),
            Envelope::Error(CallError {
                id: "m1".into(),
                code: ErrorCode::ProtocolError,
                description: "bad payload".into(),
                details: json!({"field": "meterValue"}),
            }),
        ];

        for envelope in envelopes {
            let text = codec.encode(&envelope).unwrap();
            assert_eq!(codec.decode(&text).unwrap(), envelope);
        }
    }

    #[test]
    fn heartbeat_reply_wire_shape() {
        let codec = ArrayCodec;
        let reply = Envelope::Result(CallResult {
            id: "m1".into(),
            payload: json!({"currentTime": "2026-01-20T12:00:00Z"}),
        });

        let text = codec.encode(&reply).unwrap();
        assert_eq!(
            text,
            r#"[3,"m1",{"currentTime":"2026-01-20T12:00:00Z"}]"#
        );
    }
}
