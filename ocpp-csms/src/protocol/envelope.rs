//! Protocol-neutral message envelopes
//!
//! Every wire message, regardless of generation, decodes to one of three
//! envelopes:
//! - CALL: a request carrying an action name and payload
//! - CALLRESULT: the success reply to a prior CALL
//! - CALLERROR: the failure reply to a prior CALL
//!
//! The correlation id is chosen by whoever sends the CALL and echoed
//! verbatim in the reply. It only has to be unique among calls currently
//! in flight on one connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// OCPP error codes carried in CALLERROR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Wire name used by the array framing
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }

    /// Parse a wire name; unknown names degrade to `GenericError`
    pub fn from_name(name: &str) -> Self {
        serde_json::from_value(Value::String(name.to_string()))
            .unwrap_or(ErrorCode::GenericError)
    }

    /// Numeric code used by the RPC-object framing (JSON-RPC code space)
    pub fn rpc_code(&self) -> i64 {
        match self {
            ErrorCode::FormatViolation => -32700,
            ErrorCode::ProtocolError => -32600,
            ErrorCode::NotImplemented => -32601,
            ErrorCode::TypeConstraintViolation => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::GenericError => -32000,
            ErrorCode::NotSupported => -32001,
            ErrorCode::SecurityError => -32002,
            ErrorCode::PropertyConstraintViolation => -32003,
            ErrorCode::OccurrenceConstraintViolation => -32004,
            ErrorCode::MessageTypeNotSupported => -32005,
            ErrorCode::RpcFrameworkError => -32006,
        }
    }

    /// Inverse of [`rpc_code`](Self::rpc_code); unknown codes degrade to
    /// `GenericError`
    pub fn from_rpc_code(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::FormatViolation,
            -32600 => ErrorCode::ProtocolError,
            -32601 => ErrorCode::NotImplemented,
            -32602 => ErrorCode::TypeConstraintViolation,
            -32603 => ErrorCode::InternalError,
            -32001 => ErrorCode::NotSupported,
            -32002 => ErrorCode::SecurityError,
            -32003 => ErrorCode::PropertyConstraintViolation,
            -32004 => ErrorCode::OccurrenceConstraintViolation,
            -32005 => ErrorCode::MessageTypeNotSupported,
            -32006 => ErrorCode::RpcFrameworkError,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A request, initiated by either party
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a CALL with a fresh correlation id
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }
}

/// Success reply to a prior CALL
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub id: String,
    pub payload: Value,
}

/// Failure reply to a prior CALL
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub id: String,
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl CallError {
    pub fn new(id: impl Into<String>, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// One decoded wire message, any type
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(Call),
    Result(CallResult),
    Error(CallError),
}

impl Envelope {
    /// The correlation id, present on every variant
    pub fn correlation_id(&self) -> &str {
        match self {
            Envelope::Call(c) => &c.id,
            Envelope::Result(r) => &r.id,
            Envelope::Error(e) => &e.id,
        }
    }

}

/// A frame that cannot be parsed into any known envelope shape
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl FrameError {
    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        FrameError::Malformed(what.into())
    }
}
