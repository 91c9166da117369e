//! CSMS server configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct CsmsConfig {
    /// TCP listen address for WebSocket upgrades
    pub listen_addr: SocketAddr,

    /// Interval between connection eviction sweeps
    pub eviction_interval: Duration,

    /// A silent connection older than this is evicted by the sweep
    pub stale_after: Duration,

    /// Interval between pending-command timeout sweeps
    pub command_sweep_interval: Duration,

    /// Default per-command reply timeout
    pub default_command_timeout: Duration,

    /// WebSocket message size cap
    pub max_message_size: usize,

    /// WebSocket frame size cap
    pub max_frame_size: usize,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9310".parse().expect("static addr"),
            eviction_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(1800),
            command_sweep_interval: Duration::from_secs(1),
            default_command_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl CsmsConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Set the eviction sweep interval
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Set the staleness threshold
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Set the pending-command sweep interval
    pub fn with_command_sweep_interval(mut self, interval: Duration) -> Self {
        self.command_sweep_interval = interval;
        self
    }

    /// Set the default command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.default_command_timeout = timeout;
        self
    }
}
