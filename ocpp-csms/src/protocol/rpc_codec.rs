//! OCPP 2.0 RPC-object framing
//!
//! A message is a JSON-RPC 2.0 object:
//! - CALL: {"jsonrpc": "2.0", "id": .., "method": action, "params": payload}
//! - CALLRESULT: {"jsonrpc": "2.0", "id": .., "result": payload}
//! - CALLERROR: {"jsonrpc": "2.0", "id": .., "error": {"code", "message", "data"}}
//!
//! A message carrying an id plus `result` or `error` is a reply; otherwise
//! one carrying `method` is a CALL. Anything else is malformed.

use serde_json::{Map, Value};

use super::envelope::{Call, CallError, CallResult, Envelope, ErrorCode, FrameError};
use super::ProtocolCodec;

const RPC_VERSION: &str = "2.0";

/// Codec for the RPC-object framing
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcCodec;

impl RpcCodec {
    fn correlation_id(object: &Map<String, Value>) -> Result<String, FrameError> {
        object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FrameError::malformed("id is missing or not a string"))
    }
}

impl ProtocolCodec for RpcCodec {
    fn decode(&self, text: &str) -> Result<Envelope, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value
            .as_object()
            .ok_or_else(|| FrameError::malformed("message is not an object"))?;

        match object.get("jsonrpc").and_then(Value::as_str) {
            Some(RPC_VERSION) => {}
            _ => return Err(FrameError::malformed("missing jsonrpc version tag")),
        }

        if let Some(result) = object.get("result") {
            let id = Self::correlation_id(object)?;
            return Ok(Envelope::Result(CallResult {
                id,
                payload: result.clone(),
            }));
        }

        if let Some(error) = object.get("error") {
            let id = Self::correlation_id(object)?;
            let error = error
                .as_object()
                .ok_or_else(|| FrameError::malformed("error is not an object"))?;
            let code = error
                .get("code")
                .and_then(Value::as_i64)
                .map(ErrorCode::from_rpc_code)
                .ok_or_else(|| FrameError::malformed("error code is not a number"))?;
            let description = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let details = error.get("data").cloned().unwrap_or(Value::Null);

            return Ok(Envelope::Error(CallError {
                id,
                code,
                description,
                details,
            }));
        }

        if let Some(method) = object.get("method") {
            let id = Self::correlation_id(object)?;
            let action = method
                .as_str()
                .ok_or_else(|| FrameError::malformed("method is not a string"))?
                .to_string();
            let payload = object.get("params").cloned().unwrap_or(Value::Null);

            return Ok(Envelope::Call(Call {
                id,
                action,
                payload,
            }));
        }

        Err(FrameError::malformed(
            "object carries neither method, result nor error",
        ))
    }

    fn encode(&self, envelope: &Envelope) -> Result<String, FrameError> {
        let object = match envelope {
            Envelope::Call(c) => serde_json::json!({
                "jsonrpc": RPC_VERSION,
                "id": c.id,
                "method": c.action,
                "params": c.payload,
            }),
            Envelope::Result(r) => serde_json::json!({
                "jsonrpc": RPC_VERSION,
                "id": r.id,
                "result": r.payload,
            }),
            Envelope::Error(e) => serde_json::json!({
                "jsonrpc": RPC_VERSION,
                "id": e.id,
                "error": {
                    "code": e.code.rpc_code(),
                    "message": e.description,
                    "data": e.details,
                },
            }),
        };
        Ok(serde_json::to_string(&object)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_call() {
        let codec = RpcCodec;
        let msg = codec
            .decode(r#"{"jsonrpc":"2.0","id":"m2","method":"Heartbeat","params":{}}"#)
            .unwrap();

        match msg {
            Envelope::Call(call) => {
                assert_eq!(call.id, "m2");
                assert_eq!(call.action, "Heartbeat");
                assert_eq!(call.payload, json!({}));
            }
            _ => panic!("expected CALL"),
        }
    }

    #[test]
    fn decode_result() {
        let codec = RpcCodec;
        let msg = codec
            .decode(r#"{"jsonrpc":"2.0","id":"m2","result":{"currentTime":"2026-01-20T12:00:00Z"}}"#)
            .unwrap();

        match msg {
            Envelope::Result(result) => {
                assert_eq!(result.id, "m2");
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("expected CALLRESULT"),
        }
    }

    #[test]
    fn decode_error() {
        let codec = RpcCodec;
        let msg = codec
            .decode(
                r#"{"jsonrpc":"2.0","id":"m2","error":{"code":-32601,"message":"no handler","data":{}}}"#,
            )
            .unwrap();

        match msg {
            Envelope::Error(error) => {
                assert_eq!(error.id, "m2");
                assert_eq!(error.code, ErrorCode::NotImplemented);
                assert_eq!(error.description, "no handler");
            }
            _ => panic!("expected CALLERROR"),
        }
    }

    #[test]
    fn missing_version_tag_is_malformed() {
        let codec = RpcCodec;
        assert!(matches!(
            codec.decode(r#"{"id":"m2","method":"Heartbeat"}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn no_recognized_shape_is_malformed() {
        let codec = RpcCodec;
        assert!(matches!(
            codec.decode(r#"{"jsonrpc":"2.0","id":"m2"}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn array_frame_is_malformed_here() {
        let codec = RpcCodec;
        assert!(matches!(
            codec.decode(r#"[2,"m1","Heartbeat",{}]"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn round_trip_all_variants() {
        let codec = RpcCodec;
        let envelopes = [
            Envelope::Call(Call {
                id: "m2".into(),
                action: "Reset".into(),
                payload: json!({"type": "Soft"}),
            }),
            Envelope::Result(CallResult {
                id: "m2".into(),
                payload: json!({"status": "Accepted"}),
            }),
            Envelope::Error(CallError {
                id: "m2".into(),
                code: ErrorCode::InternalError,
                description: "internal error".into(),
                details: Value::Null,
            }),
        ];

        for envelope in envelopes {
            let text = codec.encode(&envelope).unwrap();
            assert_eq!(codec.decode(&text).unwrap(), envelope);
        }
    }
}
