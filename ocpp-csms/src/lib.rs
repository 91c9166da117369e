//! # OCPP CSMS Connection Core
//!
//! Server-side endpoint for the OCPP (Open Charge Point Protocol) family.
//! Charging stations hold long-lived WebSocket connections to this
//! endpoint; this crate provides everything those connections ride on:
//! the connection registry, the two wire framings, action dispatch, and
//! correlation of server-initiated commands with their asynchronous
//! replies.
//!
//! ## Architecture
//!
//! ```text
//! Charging stations (WebSocket, ocpp1.6 / ocpp2.0)
//!       │ text frames
//!       ▼
//! ┌──────────────────────────────────────────────┐
//! │  CsmsServer                                  │
//! │  negotiate ─► codec ─► Call?  ─► dispatcher ─┼─► business handlers
//! │     │                  reply? ─► commands    │
//! │     ▼                                        │
//! │  ConnectionRegistry      PendingCommandStore │
//! │  (eviction sweep)        (timeout sweep)     │
//! └──────────────────┬───────────────────────────┘
//!                    │ CommandService::send_command
//!                    ▼
//!            administrative callers
//! ```
//!
//! ## Message flow
//!
//! 1. A station connects; the protocol generation is negotiated once
//!    (sub-protocol, query, header, path, fallback) and fixed for the
//!    connection's lifetime.
//! 2. Inbound CALLs go through [`dispatch::ActionDispatcher`] to the
//!    handler registered for `(generation, action)`; the reply is framed
//!    back on the same socket. Nothing a station sends can crash the loop.
//! 3. [`command::CommandService`] sends server-initiated CALLs and hands
//!    the caller a receiver resolving exactly once: reply, timeout, or
//!    cancellation when the connection goes away.
//!
//! Persistence, payload validation and the admin HTTP API are external
//! collaborators behind the [`dispatch::ActionHandler`] and
//! [`registry::StatusSink`] seams.

pub mod command;
pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

pub use command::{CommandError, CommandOutcome, CommandService, PendingCommandStore};
pub use config::CsmsConfig;
pub use dispatch::{ActionDispatcher, ActionHandler, HandlerError, HandlerRegistry};
pub use protocol::{
    negotiate, Call, CallError, CallResult, Envelope, ErrorCode, FrameError, HandshakeInfo,
    Negotiated, ProtocolCodec, ProtocolGeneration,
};
pub use registry::{Connection, ConnectionRegistry, StatusSink};
pub use server::{CsmsServer, ServerError};
pub use transport::{Transport, TransportError, WsTransport};
