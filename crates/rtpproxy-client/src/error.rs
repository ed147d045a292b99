//! Error types for the RTP proxy client
//!
//! Only construction can fail. Once a client exists every asynchronous
//! outcome is delivered through reply callbacks or observable state.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for RTP proxy client operations
pub type Result<T> = std::result::Result<T, RtpProxyError>;

/// Errors that can occur while building an RTP proxy client
#[derive(Debug, Error)]
pub enum RtpProxyError {
    /// The relay specification string could not be parsed
    #[error("Invalid RTP proxy spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    /// Name resolution of the relay host failed
    #[error("Failed to resolve RTP proxy host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but produced no address of the wanted family
    #[error("No {family} address found for RTP proxy host '{host}'")]
    NoAddress { host: String, family: &'static str },

    /// The local control socket could not be bound
    #[error("Failed to bind RTP proxy control socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration values
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RtpProxyError {
    /// Create an invalid spec error
    pub fn invalid_spec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error came from a malformed spec or configuration
    /// rather than from the network
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidSpec { .. } | Self::Configuration { .. })
    }
}
