//! Relay control transports
//!
//! The client talks to the relay through one [`RtpProxyTransport`], chosen
//! once at construction from the resolved endpoint. Two implementations
//! exist: a datagram transport for `udp:`/`udp6:` relays and a stream
//! transport for TCP and unix-domain relays. The client never branches on
//! which one is in use except through [`RtpProxyTransport::is_local`].

pub mod stream;
pub mod udp;

pub use stream::StreamTransport;
pub use udp::UdpTransport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::address::ResolvedEndpoint;
use crate::config::RtpProxyConfig;
use crate::error::Result;

/// Receives the reply to one command, or `None` if the command failed
pub type ReplyCallback = Box<dyn FnOnce(Option<String>) + Send + 'static>;

/// Command channel to a relay
///
/// Every submitted command gets exactly one callback. No ordering is
/// guaranteed between commands outstanding at the same time.
pub trait RtpProxyTransport: Send + Sync + fmt::Debug {
    /// Submit a command; `callback` receives the reply text
    fn send_command(&self, command: &str, callback: ReplyCallback);

    /// Whether the relay runs on this host
    fn is_local(&self) -> bool;

    /// Stop all network activity; pending and later commands fail with `None`
    fn shutdown(&self);

    /// Smoothed command round-trip time, once known
    fn rtpc_delay(&self) -> Option<Duration> {
        None
    }
}

/// Create the transport matching a resolved endpoint
pub async fn create_transport(
    endpoint: &ResolvedEndpoint,
    config: &RtpProxyConfig,
) -> Result<Arc<dyn RtpProxyTransport>> {
    if endpoint.kind.is_datagram() {
        let transport = UdpTransport::bind(endpoint, config).await?;
        Ok(Arc::new(transport))
    } else {
        let transport = StreamTransport::new(endpoint, config)?;
        Ok(Arc::new(transport))
    }
}

/// Exponentially smoothed round-trip time
#[derive(Debug, Default)]
pub(crate) struct RttEstimator {
    smoothed: Mutex<Option<Duration>>,
}

impl RttEstimator {
    pub(crate) fn update(&self, sample: Duration) {
        let mut smoothed = self.smoothed.lock();
        *smoothed = Some(match *smoothed {
            // srtt = 7/8 srtt + 1/8 sample
            Some(prev) => (prev * 7 + sample) / 8,
            None => sample,
        });
    }

    pub(crate) fn get(&self) -> Option<Duration> {
        *self.smoothed.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_estimator() {
        let rtt = RttEstimator::default();
        assert_eq!(rtt.get(), None);

        rtt.update(Duration::from_millis(80));
        assert_eq!(rtt.get(), Some(Duration::from_millis(80)));

        rtt.update(Duration::from_millis(160));
        assert_eq!(rtt.get(), Some(Duration::from_millis(90)));
    }
}
