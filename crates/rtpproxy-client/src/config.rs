//! Client configuration
//!
//! This module defines the construction options and timing knobs of an
//! [`RtpProxyClient`](crate::RtpProxyClient).

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RtpProxyError};

/// Port the relay listens on when a spec omits one
pub const DEFAULT_RTPP_PORT: u16 = 22222;

/// RTP proxy client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpProxyConfig {
    /// Relay specification string, e.g. `udp:10.0.0.1:22222` or `unix:/var/run/rtpproxy.sock`
    pub spec_path: Option<String>,
    /// Skip the version handshake and consider the relay online right away
    pub no_version_check: bool,
    /// Number of worker connections used by stream transports
    pub nworkers: Option<usize>,
    /// Local address the UDP control socket binds to
    pub bind_address: Option<SocketAddr>,
    /// Local signaling address, reported as the proxy address for unix-domain relays
    pub sip_address: String,
    /// Base interval between heartbeats while online
    pub heartbeat_interval_ms: u64,
    /// Base interval between version check retries while offline
    pub version_retry_interval_ms: u64,
    /// Relative jitter applied to every interval (0.1 means ±10%)
    pub jitter: f64,
    /// Initial UDP retransmission interval, doubled on every retry
    pub udp_retransmit_interval_ms: u64,
    /// Maximum number of UDP retransmissions before a command fails
    pub udp_max_retransmits: u32,
    /// Pause before a stream worker reconnects after a failure
    pub stream_reconnect_delay_ms: u64,
}

impl Default for RtpProxyConfig {
    fn default() -> Self {
        Self {
            spec_path: None,
            no_version_check: false,
            nworkers: None,
            bind_address: None,
            sip_address: "127.0.0.1".to_string(),
            heartbeat_interval_ms: 1_000,
            version_retry_interval_ms: 60_000,
            jitter: 0.1,
            udp_retransmit_interval_ms: 1_000,
            udp_max_retransmits: 3,
            stream_reconnect_delay_ms: 1_000,
        }
    }
}

impl RtpProxyConfig {
    /// Create a configuration for the given relay spec
    pub fn new(spec_path: impl Into<String>) -> Self {
        Self {
            spec_path: Some(spec_path.into()),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| RtpProxyError::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Disable the version handshake
    pub fn with_no_version_check(mut self, no_version_check: bool) -> Self {
        self.no_version_check = no_version_check;
        self
    }

    /// Set the number of stream workers
    pub fn with_nworkers(mut self, nworkers: usize) -> Self {
        self.nworkers = Some(nworkers);
        self
    }

    /// Set the local bind address for UDP relays
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set the local signaling address
    pub fn with_sip_address(mut self, addr: impl Into<String>) -> Self {
        self.sip_address = addr.into();
        self
    }

    /// Set the heartbeat interval, rounded up to whole milliseconds
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = millis_ceil(interval);
        self
    }

    /// Set the version check retry interval, rounded up to whole milliseconds
    pub fn with_version_retry_interval(mut self, interval: Duration) -> Self {
        self.version_retry_interval_ms = millis_ceil(interval);
        self
    }

    /// Set the relative jitter
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the configuration for values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.nworkers == Some(0) {
            return Err(RtpProxyError::config("nworkers must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(RtpProxyError::config(format!(
                "jitter must be within [0, 1), got {}",
                self.jitter
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.version_retry_interval_ms == 0
            || self.udp_retransmit_interval_ms == 0
        {
            return Err(RtpProxyError::config("intervals must be non-zero"));
        }
        Ok(())
    }

    /// Number of stream workers, defaulting to one
    pub fn workers(&self) -> usize {
        self.nworkers.unwrap_or(1)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn version_retry_interval(&self) -> Duration {
        Duration::from_millis(self.version_retry_interval_ms)
    }

    pub fn udp_retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.udp_retransmit_interval_ms)
    }

    pub fn stream_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.stream_reconnect_delay_ms)
    }
}

// Intervals are stored in milliseconds; a non-zero duration never becomes 0
fn millis_ceil(interval: Duration) -> u64 {
    u64::try_from(interval.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}
