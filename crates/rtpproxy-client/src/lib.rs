//! RTP proxy control client for the rvoip stack
//!
//! This crate drives an external media relay ("RTP proxy") over its
//! line-oriented control protocol. It resolves a relay specification into a
//! transport, performs the version handshake, discovers optional relay
//! capabilities and watches relay liveness with periodic heartbeats.
//!
//! ```rust,no_run
//! use rvoip_rtpproxy_client::{RtpProxyClient, RtpProxyConfig, RtpProxyEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RtpProxyClient::new(RtpProxyConfig::new("udp:10.0.0.5:22222")).await?;
//! let mut events = client.subscribe();
//!
//! while let Ok(event) = events.recv().await {
//!     if let RtpProxyEvent::Online { .. } = event {
//!         break;
//!     }
//! }
//!
//! let reply = client.command("Ib").await;
//! println!("relay stats: {:?}", reply);
//! client.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod timer;
pub mod transport;

// Re-export commonly used types
pub use address::{ProxyAddress, ProxySpec, ResolvedEndpoint, TransportKind};
pub use client::caps::{Capabilities, Capability};
pub use client::stats::HeartbeatStats;
pub use client::{ClientStatus, RtpProxyClient};
pub use config::{RtpProxyConfig, DEFAULT_RTPP_PORT};
pub use error::{Result, RtpProxyError};
pub use events::RtpProxyEvent;
pub use timer::{Scheduler, TokioScheduler};
pub use transport::{ReplyCallback, RtpProxyTransport, StreamTransport, UdpTransport};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Capabilities, Capability, ClientStatus, HeartbeatStats, ProxyAddress, ReplyCallback,
        Result, RtpProxyClient, RtpProxyConfig, RtpProxyError, RtpProxyEvent,
        RtpProxyTransport, Scheduler, TokioScheduler,
    };
}
