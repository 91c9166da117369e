//! Action dispatch
//!
//! Routes an inbound CALL to the business handler registered for its
//! `(generation, action)` pair and always produces a reply envelope. This
//! is the boundary that keeps one malformed payload or buggy handler from
//! taking down the connection loop: nothing escapes `dispatch`, not even a
//! handler panic.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::protocol::{Call, CallError, CallResult, Envelope, ErrorCode, ProtocolGeneration};

/// Failure modes a handler may report
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload failed validation; the description goes to the wire
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unexpected internal failure; logged in full, generic on the wire
    #[error("internal handler error: {0}")]
    Internal(String),
}

/// Business handler for one OCPP action. Registered per
/// `(generation, action)` at startup; this is the seam to all business
/// logic (boot data, authorization, metering, ...).
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, device_id: &str, payload: Value) -> Result<Value, HandlerError>;
}

/// Static handler table, built once at startup and read-only afterwards
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(ProtocolGeneration, String), Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Re-registering the same `(generation, action)`
    /// replaces the previous handler with a warning.
    pub fn register(
        mut self,
        generation: ProtocolGeneration,
        action: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        let action = action.into();
        if self
            .handlers
            .insert((generation, action.clone()), handler)
            .is_some()
        {
            warn!("handler for ({}, {}) re-registered", generation, action);
        }
        self
    }

    /// Register the same handler under both generations
    pub fn register_all(
        mut self,
        action: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        let action = action.into();
        for generation in [ProtocolGeneration::V16, ProtocolGeneration::V20] {
            self = self.register(generation, action.clone(), handler.clone());
        }
        self
    }

    pub fn get(
        &self,
        generation: ProtocolGeneration,
        action: &str,
    ) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(&(generation, action.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Dispatcher for one protocol generation
pub struct ActionDispatcher {
    generation: ProtocolGeneration,
    handlers: Arc<HandlerRegistry>,
}

impl ActionDispatcher {
    pub fn new(generation: ProtocolGeneration, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            generation,
            handlers,
        }
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    /// Dispatch one CALL. Always returns a CALLRESULT or CALLERROR; never
    /// panics, never propagates a handler failure.
    pub async fn dispatch(&self, device_id: &str, call: Call) -> Envelope {
        let handler = match self.handlers.get(self.generation, &call.action) {
            Some(handler) => handler.clone(),
            None => {
                warn!(
                    "no handler for ({}, {}) from {}",
                    self.generation, call.action, device_id
                );
                return Envelope::Error(
                    CallError::new(
                        call.id,
                        ErrorCode::NotImplemented,
                        format!("action {} is not implemented", call.action),
                    )
                    .with_details(serde_json::json!({ "action": call.action })),
                );
            }
        };

        debug!("dispatching {} from {}", call.action, device_id);

        let outcome = AssertUnwindSafe(handler.handle(device_id, call.payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(payload)) => Envelope::Result(CallResult {
                id: call.id,
                payload,
            }),
            Ok(Err(HandlerError::Validation(description))) => {
                debug!(
                    "{} rejected {} payload: {}",
                    device_id, call.action, description
                );
                Envelope::Error(CallError::new(
                    call.id,
                    ErrorCode::ProtocolError,
                    description,
                ))
            }
            Ok(Err(HandlerError::Internal(detail))) => {
                error!(
                    "handler for {} failed on {} frame {}: {}",
                    call.action, device_id, call.id, detail
                );
                Envelope::Error(CallError::new(
                    call.id,
                    ErrorCode::InternalError,
                    "internal error",
                ))
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(
                    "handler for {} panicked on {} frame {}: {}",
                    call.action, device_id, call.id, detail
                );
                Envelope::Error(CallError::new(
                    call.id,
                    ErrorCode::InternalError,
                    "internal error",
                ))
            }
        }
    }
}
