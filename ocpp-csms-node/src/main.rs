//! OCPP CSMS Node - CLI for the connection core
//!
//! Runs the CSMS endpoint with a demonstration handler set, suitable for
//! pointing real or simulated charging stations at.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port
//! ocpp-csms-node
//!
//! # Custom address and staleness threshold
//! ocpp-csms-node --listen 0.0.0.0:9310 --stale-mins 30
//!
//! # Faster sweeps for local testing
//! ocpp-csms-node --eviction-secs 10 --stale-mins 1
//! ```
//!
//! Stations connect to `ws://host:port/{version}/{station_id}` or
//! negotiate the generation via the `ocpp1.6` / `ocpp2.0` sub-protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ocpp_csms::{
    ActionHandler, CsmsConfig, CsmsServer, HandlerError, HandlerRegistry, StatusSink,
};

/// OCPP CSMS connection endpoint
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:9310")]
    listen: SocketAddr,

    /// Staleness threshold for the connection eviction sweep (minutes)
    #[arg(long, default_value = "30")]
    stale_mins: u64,

    /// Interval between eviction sweeps (seconds)
    #[arg(long, default_value = "300")]
    eviction_secs: u64,

    /// Default reply timeout for server-initiated commands (seconds)
    #[arg(long, default_value = "30")]
    command_timeout_secs: u64,

    /// Boot registration interval reported to stations (seconds)
    #[arg(long, default_value = "300")]
    heartbeat_interval: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

/// Answers Heartbeat with the current server time
struct HeartbeatHandler;

#[async_trait]
impl ActionHandler for HeartbeatHandler {
    async fn handle(&self, _device_id: &str, _payload: Value) -> Result<Value, HandlerError> {
        Ok(json!({ "currentTime": chrono::Utc::now().to_rfc3339() }))
    }
}

/// Accepts every BootNotification and hands out the heartbeat interval
struct BootNotificationHandler {
    interval: i64,
}

#[async_trait]
impl ActionHandler for BootNotificationHandler {
    async fn handle(&self, device_id: &str, payload: Value) -> Result<Value, HandlerError> {
        let vendor = payload
            .pointer("/chargingStation/vendorName")
            .or_else(|| payload.get("chargePointVendor"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!("boot from {} (vendor {})", device_id, vendor);

        Ok(json!({
            "status": "Accepted",
            "currentTime": chrono::Utc::now().to_rfc3339(),
            "interval": self.interval,
        }))
    }
}

/// Logs and acknowledges StatusNotification
struct StatusNotificationHandler;

#[async_trait]
impl ActionHandler for StatusNotificationHandler {
    async fn handle(&self, device_id: &str, payload: Value) -> Result<Value, HandlerError> {
        if !payload.is_object() {
            return Err(HandlerError::Validation(
                "StatusNotification payload must be an object".into(),
            ));
        }
        info!(
            "status from {}: {}",
            device_id,
            payload
                .get("connectorStatus")
                .or_else(|| payload.get("status"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("?")
        );
        Ok(json!({}))
    }
}

/// Logs offline transitions; a real deployment plugs persistence in here
struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn device_offline(
        &self,
        device_id: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("{} is offline", device_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             OCPP CSMS Node - Connection Endpoint             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:    {:<49} ║", args.listen.to_string());
    println!("║  Stale:     {:<49} ║", format!("{} min", args.stale_mins));
    println!("║  Sweep:     {:<49} ║", format!("{} s", args.eviction_secs));
    println!("║  Cmd t/o:   {:<49} ║", format!("{} s", args.command_timeout_secs));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = CsmsConfig::new(args.listen)
        .with_stale_after(Duration::from_secs(args.stale_mins * 60))
        .with_eviction_interval(Duration::from_secs(args.eviction_secs))
        .with_command_timeout(Duration::from_secs(args.command_timeout_secs));

    let handlers = HandlerRegistry::new()
        .register_all("Heartbeat", Arc::new(HeartbeatHandler))
        .register_all(
            "BootNotification",
            Arc::new(BootNotificationHandler {
                interval: args.heartbeat_interval,
            }),
        )
        .register_all("StatusNotification", Arc::new(StatusNotificationHandler));

    let server = CsmsServer::new(config, handlers, Some(Arc::new(LogStatusSink)));

    // Periodic status report, one line per station
    let registry = server.registry().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let connections = registry.list_all();
            info!("{} station(s) connected", connections.len());
            for conn in connections {
                info!(
                    "  {}: ocpp {}, agent {}, idle {}s, connected {}",
                    conn.device_id(),
                    conn.generation(),
                    conn.meta("user_agent").unwrap_or_else(|| "?".into()),
                    conn.idle_for().num_seconds(),
                    conn.connected_at().format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
    });

    info!("Starting CSMS endpoint...");
    server.run().await?;

    Ok(())
}
