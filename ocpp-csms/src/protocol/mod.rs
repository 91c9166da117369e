//! Protocol generations, wire codecs and handshake negotiation
//!
//! This module provides the protocol layer of the CSMS:
//! - `envelope`: generation-neutral CALL / CALLRESULT / CALLERROR envelopes
//! - `array_codec`: OCPP 1.6 array framing
//! - `rpc_codec`: OCPP 2.0 RPC-object framing
//! - negotiation: picks the generation a new connection speaks, once, at
//!   handshake time; the codec binding never changes afterwards

pub mod array_codec;
pub mod envelope;
pub mod rpc_codec;

use tracing::warn;

pub use array_codec::ArrayCodec;
pub use envelope::{Call, CallError, CallResult, Envelope, ErrorCode, FrameError};
pub use rpc_codec::RpcCodec;

/// Symmetric text-frame codec for one protocol generation
pub trait ProtocolCodec: Send + Sync {
    fn decode(&self, text: &str) -> Result<Envelope, FrameError>;
    fn encode(&self, envelope: &Envelope) -> Result<String, FrameError>;
}

/// A protocol version family with its own wire framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolGeneration {
    /// OCPP 1.6 (array framing)
    V16,
    /// OCPP 2.0 (RPC-object framing)
    V20,
}

static ARRAY_CODEC: ArrayCodec = ArrayCodec;
static RPC_CODEC: RpcCodec = RpcCodec;

impl ProtocolGeneration {
    /// Oldest supported generation, used as the negotiation fallback
    pub const OLDEST: Self = ProtocolGeneration::V16;

    /// Short version tag ("1.6", "2.0")
    pub fn tag(&self) -> &'static str {
        match self {
            ProtocolGeneration::V16 => "1.6",
            ProtocolGeneration::V20 => "2.0",
        }
    }

    /// WebSocket sub-protocol name advertised for this generation
    pub fn subprotocol(&self) -> &'static str {
        match self {
            ProtocolGeneration::V16 => "ocpp1.6",
            ProtocolGeneration::V20 => "ocpp2.0",
        }
    }

    /// Match a version alias, case-insensitively
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias.trim().to_ascii_lowercase().as_str() {
            "ocpp1.6" | "1.6" => Some(ProtocolGeneration::V16),
            "ocpp2.0" | "ocpp2.0.1" | "2.0" | "2.0.1" => Some(ProtocolGeneration::V20),
            _ => None,
        }
    }

    /// The wire codec bound to this generation
    pub fn codec(&self) -> &'static dyn ProtocolCodec {
        match self {
            ProtocolGeneration::V16 => &ARRAY_CODEC,
            ProtocolGeneration::V20 => &RPC_CODEC,
        }
    }
}

impl std::fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// What the connection request offered, extracted from the WebSocket
/// upgrade before negotiation
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    /// Request path, e.g. "/ocpp2.0/CS001"
    pub path: String,
    /// Raw query string, if any
    pub query: Option<String>,
    /// Offered Sec-WebSocket-Protocol values, in client order
    pub subprotocols: Vec<String>,
    /// X-OCPP-Version header, if present
    pub version_header: Option<String>,
    /// User-Agent header, if present
    pub user_agent: Option<String>,
}

impl HandshakeInfo {
    /// Device identifier: the last non-empty path segment that is not
    /// itself a version alias. A path like "/ocpp1.6" names a version
    /// but no station, so it carries no device id.
    pub fn device_id(&self) -> Option<&str> {
        self.path.split('/').rev().find(|segment| {
            !segment.is_empty() && ProtocolGeneration::from_alias(segment).is_none()
        })
    }
}

/// Where the negotiated generation came from, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationSource {
    Subprotocol,
    Query,
    Header,
    Path,
    Fallback,
}

/// Outcome of protocol negotiation for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub generation: ProtocolGeneration,
    pub source: NegotiationSource,
}

/// Pick the protocol generation for a new connection.
///
/// Resolution order, first match wins: sub-protocol list, version query
/// parameter, version header, path substring. Unrecognized requests fall
/// back to the oldest generation instead of being rejected; the fallback
/// usually means a misconfigured station, so it is logged as a warning.
pub fn negotiate(info: &HandshakeInfo) -> Negotiated {
    for offered in &info.subprotocols {
        if let Some(generation) = ProtocolGeneration::from_alias(offered) {
            return Negotiated {
                generation,
                source: NegotiationSource::Subprotocol,
            };
        }
    }

    if let Some(query) = &info.query {
        for pair in query.split('&') {
            if let Some(version) = pair.strip_prefix("version=") {
                if let Some(generation) = ProtocolGeneration::from_alias(version) {
                    return Negotiated {
                        generation,
                        source: NegotiationSource::Query,
                    };
                }
            }
        }
    }

    if let Some(header) = &info.version_header {
        if let Some(generation) = ProtocolGeneration::from_alias(header) {
            return Negotiated {
                generation,
                source: NegotiationSource::Header,
            };
        }
    }

    let path = info.path.to_ascii_lowercase();
    for generation in [ProtocolGeneration::V20, ProtocolGeneration::V16] {
        if path.contains(generation.subprotocol()) || path.contains(generation.tag()) {
            return Negotiated {
                generation,
                source: NegotiationSource::Path,
            };
        }
    }

    warn!(
        "no protocol version negotiated for {}, falling back to {}",
        info.path,
        ProtocolGeneration::OLDEST
    );
    Negotiated {
        generation: ProtocolGeneration::OLDEST,
        source: NegotiationSource::Fallback,
    }
}
