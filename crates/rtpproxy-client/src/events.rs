//! RTP proxy client event system
//!
//! State changes of a client are broadcast to any number of subscribers.
//! Emission never blocks; events sent while nobody listens are dropped.

use tokio::sync::broadcast;

use crate::client::caps::Capabilities;
use crate::client::stats::HeartbeatStats;

// Default channel capacity
pub(crate) const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Events emitted by an [`RtpProxyClient`](crate::RtpProxyClient)
#[derive(Debug, Clone, PartialEq)]
pub enum RtpProxyEvent {
    /// The relay answered the version handshake and the client went online
    Online {
        /// Address advertised for the relay
        proxy_address: String,
    },
    /// The relay stopped answering or changed protocol
    Offline {
        /// Address advertised for the relay
        proxy_address: String,
    },
    /// Every capability probe has been answered
    CapabilitiesDiscovered(Capabilities),
    /// A heartbeat reply was received
    Stats(HeartbeatStats),
    /// The client has been shut down
    ShutDown,
}

pub(crate) fn channel() -> broadcast::Sender<RtpProxyEvent> {
    let (tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
    tx
}
