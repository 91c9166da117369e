//! Server-initiated commands and reply correlation
//!
//! `CommandService::submit` frames a CALL, records a pending entry keyed by
//! the fresh correlation id, sends it on the device's live connection and
//! hands the caller a receiver that resolves exactly once: with the
//! device's CALLRESULT/CALLERROR, with `Timeout` from the expiry sweep, or
//! with `Cancelled` when the connection goes away first. Removal from the
//! pending map is the atomic claim, so concurrent resolution races cannot
//! produce two outcomes. Late or duplicate replies hit an unknown id and
//! are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::{Call, Envelope, ErrorCode, FrameError};
use crate::registry::ConnectionRegistry;
use crate::transport::TransportError;

/// Terminal outcome of one submitted command
#[derive(Debug)]
pub enum CommandOutcome {
    /// The device answered with a CALLRESULT
    Result(Value),
    /// The device answered with a CALLERROR
    Error {
        code: ErrorCode,
        description: String,
        details: Value,
    },
    /// No reply within the configured window
    Timeout,
    /// The device's connection closed while the command was pending
    Cancelled,
}

/// Failures before a command ever becomes pending
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("failed to encode command: {0}")]
    Encode(#[from] FrameError),

    #[error("failed to send command: {0}")]
    Send(#[from] TransportError),
}

/// One outstanding server-initiated CALL
struct PendingCommand {
    device_id: String,
    action: String,
    submitted_at: Instant,
    timeout: Duration,
    reply_tx: oneshot::Sender<CommandOutcome>,
}

impl PendingCommand {
    fn is_expired(&self) -> bool {
        self.submitted_at.elapsed() >= self.timeout
    }
}

/// Book-keeping for commands awaiting a reply, keyed by correlation id
#[derive(Default)]
pub struct PendingCommandStore {
    pending: DashMap<String, PendingCommand>,
}

impl PendingCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, correlation_id: String, entry: PendingCommand) {
        self.pending.insert(correlation_id, entry);
    }

    /// Drop an entry without producing an outcome (send never happened)
    fn discard(&self, correlation_id: &str) {
        self.pending.remove(correlation_id);
    }

    /// Resolve the entry for `correlation_id`. Removing the entry is the
    /// atomic claim; a second resolution for the same id finds nothing and
    /// is dropped. Returns whether the id was pending.
    pub fn resolve(&self, correlation_id: &str, outcome: CommandOutcome) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, entry)) => {
                debug!(
                    "resolving {} for {} ({:?} after {:?})",
                    correlation_id,
                    entry.device_id,
                    std::mem::discriminant(&outcome),
                    entry.submitted_at.elapsed()
                );
                // The caller may have given up and dropped the receiver
                let _ = entry.reply_tx.send(outcome);
                true
            }
            None => {
                warn!(
                    "reply for unknown correlation id {} dropped (stale or duplicate)",
                    correlation_id
                );
                false
            }
        }
    }

    /// Resolve every pending command addressed to `device_id` with
    /// `Cancelled`. Called when the device's connection goes away so
    /// callers do not sit out the full timeout.
    pub fn cancel_for_device(&self, device_id: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().device_id == device_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if let Some((_, entry)) = self
                .pending
                .remove_if(&id, |_, entry| entry.device_id == device_id)
            {
                let _ = entry.reply_tx.send(CommandOutcome::Cancelled);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("cancelled {} pending command(s) for {}", cancelled, device_id);
        }
        cancelled
    }

    /// One expiry pass: entries past their timeout resolve `Timeout` and
    /// are removed. A reply arriving later is the unknown-id case.
    pub fn expire_overdue(&self) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for id in ids {
            // Re-check under the claim: a reply may have won the race
            if let Some((_, entry)) = self.pending.remove_if(&id, |_, entry| entry.is_expired()) {
                warn!(
                    "command {} ({}) to {} timed out after {:?}",
                    id, entry.action, entry.device_id, entry.timeout
                );
                let _ = entry.reply_tx.send(CommandOutcome::Timeout);
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }
}

/// Sends commands to devices and correlates the asynchronous replies.
/// This is the surface the administrative API calls into.
pub struct CommandService {
    registry: Arc<ConnectionRegistry>,
    store: Arc<PendingCommandStore>,
}

impl CommandService {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            store: Arc::new(PendingCommandStore::new()),
        }
    }

    pub fn store(&self) -> &Arc<PendingCommandStore> {
        &self.store
    }

    /// Frame and send a CALL to `device_id`, returning the correlation id
    /// and a receiver for the single terminal outcome. Fails immediately
    /// with `NotConnected` when the device has no live connection - a
    /// command is never silently queued.
    pub async fn submit(
        &self,
        device_id: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<(String, oneshot::Receiver<CommandOutcome>), CommandError> {
        let connection = self
            .registry
            .get(device_id)
            .ok_or_else(|| CommandError::NotConnected(device_id.to_string()))?;

        let call = Call::new(action, payload);
        let correlation_id = call.id.clone();
        let frame = connection.generation().codec().encode(&Envelope::Call(call))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        // Insert before sending so a fast reply cannot miss the entry
        self.store.insert(
            correlation_id.clone(),
            PendingCommand {
                device_id: device_id.to_string(),
                action: action.to_string(),
                submitted_at: Instant::now(),
                timeout,
                reply_tx,
            },
        );

        if let Err(e) = connection.send(&frame).await {
            self.store.discard(&correlation_id);
            return Err(e.into());
        }

        debug!("submitted {} to {} as {}", action, device_id, correlation_id);
        Ok((correlation_id, reply_rx))
    }

    /// Submit and await the terminal outcome
    pub async fn send_command(
        &self,
        device_id: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CommandOutcome, CommandError> {
        let (_, reply_rx) = self.submit(device_id, action, payload, timeout).await?;
        // A dropped sender without an outcome can only mean the entry was
        // torn down along with the store
        Ok(reply_rx.await.unwrap_or(CommandOutcome::Cancelled))
    }

    /// Feed an inbound CALLRESULT/CALLERROR into the correlation store
    pub fn resolve_reply(&self, envelope: Envelope) {
        match envelope {
            Envelope::Result(result) => {
                self.store
                    .resolve(&result.id, CommandOutcome::Result(result.payload));
            }
            Envelope::Error(error) => {
                self.store.resolve(
                    &error.id,
                    CommandOutcome::Error {
                        code: error.code,
                        description: error.description,
                        details: error.details,
                    },
                );
            }
            Envelope::Call(call) => {
                // Calls are routed to the dispatcher, never here
                warn!("CALL {} fed to reply correlation, dropped", call.id);
            }
        }
    }

    pub fn cancel_for_device(&self, device_id: &str) -> usize {
        self.store.cancel_for_device(device_id)
    }

    /// Spawn the periodic timeout sweep. Runs until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = service.store.expire_overdue();
                if expired > 0 {
                    debug!("timeout sweep expired {} command(s)", expired);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallError, CallResult, ProtocolGeneration};
    use crate::transport::testing::MockTransport;
    use serde_json::json;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    async fn connected_service() -> (Arc<CommandService>, Arc<MockTransport>) {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(1800), None));
        let (transport, _feed) = MockTransport::new();
        registry
            .register("CP1", ProtocolGeneration::V16, transport.clone(), addr())
            .await;
        (Arc::new(CommandService::new(registry)), transport)
    }

    #[tokio::test]
    async fn submit_sends_a_call_frame() {
        let (service, transport) = connected_service().await;

        let (correlation_id, _reply_rx) = service
            .submit("CP1", "Reset", json!({"type": "Soft"}), Duration::from_secs(5))
            .await
            .unwrap();

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(&correlation_id));
        assert!(frames[0].contains("Reset"));
        assert!(service.store().contains(&correlation_id));
    }

    #[tokio::test]
    async fn submit_to_unknown_device_is_not_connected() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(1800), None));
        let service = CommandService::new(registry);

        let err = service
            .submit("CP2", "Reset", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::NotConnected(ref id) if id == "CP2"));
        assert!(service.store().is_empty());
    }

    #[tokio::test]
    async fn send_failure_discards_the_entry() {
        let (service, transport) = connected_service().await;
        transport.fail_sends();

        let err = service
            .submit("CP1", "Reset", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Send(_)));
        assert!(service.store().is_empty());
    }

    #[tokio::test]
    async fn reply_resolves_the_caller() {
        let (service, _transport) = connected_service().await;

        let (correlation_id, reply_rx) = service
            .submit("CP1", "Reset", json!({}), Duration::from_secs(5))
            .await
            .unwrap();

        service.resolve_reply(Envelope::Result(CallResult {
            id: correlation_id.clone(),
            payload: json!({"status": "Accepted"}),
        }));

        match reply_rx.await.unwrap() {
            CommandOutcome::Result(payload) => assert_eq!(payload["status"], "Accepted"),
            other => panic!("expected Result, got {other:?}"),
        }
        assert!(!service.store().contains(&correlation_id));
    }

    #[tokio::test]
    async fn error_reply_resolves_with_error() {
        let (service, _transport) = connected_service().await;

        let (correlation_id, reply_rx) = service
            .submit("CP1", "Reset", json!({}), Duration::from_secs(5))
            .await
            .unwrap();

        service.resolve_reply(Envelope::Error(CallError::new(
            correlation_id,
            ErrorCode::NotSupported,
            "reset not supported",
        )));

        match reply_rx.await.unwrap() {
            CommandOutcome::Error { code, .. } => assert_eq!(code, ErrorCode::NotSupported),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_times_out_and_entry_is_gone() {
        let (service, _transport) = connected_service().await;
        let sweeper = service.spawn_sweeper(Duration::from_secs(1));

        let (correlation_id, reply_rx) = service
            .submit("CP1", "Reset", json!({"type": "Soft"}), Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;

        match reply_rx.await.unwrap() {
            CommandOutcome::Timeout => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(!service.store().contains(&correlation_id));
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout_is_dropped() {
        let (service, _transport) = connected_service().await;
        let sweeper = service.spawn_sweeper(Duration::from_secs(1));

        let (timed_out_id, timed_out_rx) = service
            .submit("CP1", "Reset", json!({}), Duration::from_secs(2))
            .await
            .unwrap();
        let (live_id, live_rx) = service
            .submit("CP1", "GetVariables", json!({}), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(
            timed_out_rx.await.unwrap(),
            CommandOutcome::Timeout
        ));

        // Straggler for the timed-out id: dropped, does not touch the
        // other pending command
        assert!(!service.store().resolve(
            &timed_out_id,
            CommandOutcome::Result(json!({"status": "Accepted"}))
        ));
        assert!(service.store().contains(&live_id));

        service.resolve_reply(Envelope::Result(CallResult {
            id: live_id,
            payload: json!({"ok": true}),
        }));
        assert!(matches!(live_rx.await.unwrap(), CommandOutcome::Result(_)));
        sweeper.abort();
    }

    #[tokio::test]
    async fn duplicate_reply_is_dropped() {
        let (service, _transport) = connected_service().await;

        let (correlation_id, reply_rx) = service
            .submit("CP1", "Reset", json!({}), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(service
            .store()
            .resolve(&correlation_id, CommandOutcome::Result(json!({}))));
        assert!(!service
            .store()
            .resolve(&correlation_id, CommandOutcome::Result(json!({}))));

        // exactly one outcome observed
        assert!(matches!(reply_rx.await.unwrap(), CommandOutcome::Result(_)));
    }

    #[tokio::test]
    async fn cancel_for_device_resolves_cancelled() {
        let (service, _transport) = connected_service().await;

        let (_, reply_rx) = service
            .submit("CP1", "Reset", json!({}), Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(service.cancel_for_device("CP1"), 1);
        assert!(matches!(reply_rx.await.unwrap(), CommandOutcome::Cancelled));
        assert!(service.store().is_empty());
    }
}
