//! Heartbeat statistics
//!
//! The relay answers `Ib` with a block of `key: value` lines. Five keys are
//! understood, everything else is skipped.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Counters reported by the relay on every heartbeat
///
/// Advisory only: values may be stale between heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStats {
    pub sessions_created: u64,
    pub active_sessions: u64,
    pub active_streams: u64,
    pub packets_received: u64,
    pub packets_transmitted: u64,
}

impl HeartbeatStats {
    /// Parse an `Ib` reply
    ///
    /// Keys missing from the reply stay at zero. Unknown keys and values
    /// that are not integers are ignored.
    pub fn parse(reply: &str) -> Self {
        let mut stats = Self::default();
        for line in reply.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let slot = match key.trim() {
                "sessions created" => &mut stats.sessions_created,
                "active sessions" => &mut stats.active_sessions,
                "active streams" => &mut stats.active_streams,
                "packets received" => &mut stats.packets_received,
                "packets transmitted" => &mut stats.packets_transmitted,
                _ => continue,
            };
            match value.trim().parse::<u64>() {
                Ok(v) => *slot = v,
                Err(_) => trace!("Ignoring unparsable stats line '{}'", line),
            }
        }
        stats
    }
}
