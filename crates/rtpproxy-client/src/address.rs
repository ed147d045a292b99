//! Relay address resolution
//!
//! Turns a relay specification string (or an already resolved address) into
//! a concrete transport kind and endpoint. The accepted spec grammar is:
//!
//! ```text
//! udp:host[:port]       UDP over IPv4 (or whatever the name resolves to)
//! udp6:host[:port]      UDP over IPv6, host may be a bare or bracketed literal
//! tcp:host[:port]       TCP over IPv4
//! tcp6:host[:port]      TCP over IPv6
//! unix:path             unix stream socket, one connection per command
//! cunix:path            unix stream socket, persistent connection
//! path                  same as unix:path
//! ```
//!
//! The port defaults to [`DEFAULT_RTPP_PORT`] when omitted.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use tracing::debug;

use crate::config::DEFAULT_RTPP_PORT;
use crate::error::{Result, RtpProxyError};

/// Transport used to reach the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Udp6,
    Tcp,
    Tcp6,
    /// Unix stream socket, reconnected for every command
    Unix,
    /// Unix stream socket kept connected between commands
    ConnectedUnix,
}

impl TransportKind {
    /// Whether this kind is served by the datagram transport
    pub fn is_datagram(&self) -> bool {
        matches!(self, Self::Udp | Self::Udp6)
    }

    /// Whether this kind addresses a local filesystem socket
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix | Self::ConnectedUnix)
    }

    fn requires_ipv6(&self) -> bool {
        matches!(self, Self::Udp6 | Self::Tcp6)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Udp => "udp",
            Self::Udp6 => "udp6",
            Self::Tcp => "tcp",
            Self::Tcp6 => "tcp6",
            Self::Unix => "unix",
            Self::ConnectedUnix => "cunix",
        };
        f.write_str(name)
    }
}

/// Target named by a spec, before any name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecTarget {
    Host { host: String, port: u16 },
    Path(PathBuf),
}

/// Result of parsing a spec string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSpec {
    pub kind: TransportKind,
    pub target: SpecTarget,
}

/// An already resolved relay address, bypassing spec parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAddress {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// Where the relay lives, as supplied at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySpec {
    Spec(String),
    Address(ProxyAddress),
}

/// Concrete endpoint of a resolved relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{}", addr),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Fully resolved relay endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub kind: TransportKind,
    pub endpoint: Endpoint,
    /// Address advertised to the media plane for this relay
    pub proxy_address: String,
}

impl fmt::Display for ResolvedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.endpoint)
    }
}

/// Parse a relay spec string without touching the network
pub fn parse_spec(spec: &str) -> Result<ParsedSpec> {
    let (kind, rest) = if let Some(rest) = spec.strip_prefix("udp:") {
        (TransportKind::Udp, rest)
    } else if let Some(rest) = spec.strip_prefix("udp6:") {
        (TransportKind::Udp6, rest)
    } else if let Some(rest) = spec.strip_prefix("tcp:") {
        (TransportKind::Tcp, rest)
    } else if let Some(rest) = spec.strip_prefix("tcp6:") {
        (TransportKind::Tcp6, rest)
    } else if let Some(rest) = spec.strip_prefix("unix:") {
        (TransportKind::Unix, rest)
    } else if let Some(rest) = spec.strip_prefix("cunix:") {
        (TransportKind::ConnectedUnix, rest)
    } else {
        (TransportKind::Unix, spec)
    };

    let target = match kind {
        TransportKind::Unix | TransportKind::ConnectedUnix => {
            if rest.is_empty() {
                return Err(RtpProxyError::invalid_spec(spec, "empty socket path"));
            }
            SpecTarget::Path(PathBuf::from(rest))
        }
        TransportKind::Udp | TransportKind::Tcp => {
            let (host, port) = split_host_port(spec, rest)?;
            SpecTarget::Host { host, port }
        }
        TransportKind::Udp6 | TransportKind::Tcp6 => {
            let (host, port) = split_host_port6(spec, rest)?;
            SpecTarget::Host { host, port }
        }
    };

    Ok(ParsedSpec { kind, target })
}

fn split_host_port(spec: &str, rest: &str) -> Result<(String, u16)> {
    let (host, port) = match rest.split_once(':') {
        Some((host, port)) => (host, parse_port(spec, port)?),
        None => (rest, DEFAULT_RTPP_PORT),
    };
    if host.is_empty() {
        return Err(RtpProxyError::invalid_spec(spec, "empty host"));
    }
    Ok((host.to_string(), port))
}

// IPv6 hosts: `[addr]`, `[addr]:port`, a bare literal, or `name[:port]`.
// A bare literal that parses as a whole is never split, so `2001:db8::1`
// keeps its last group instead of having it taken as a port.
fn split_host_port6(spec: &str, rest: &str) -> Result<(String, u16)> {
    if let Some(bracketed) = rest.strip_prefix('[') {
        let close = bracketed
            .find(']')
            .ok_or_else(|| RtpProxyError::invalid_spec(spec, "missing closing bracket"))?;
        let host = &bracketed[..close];
        let port = match &bracketed[close + 1..] {
            "" => DEFAULT_RTPP_PORT,
            tail => match tail.strip_prefix(':') {
                Some(port) => parse_port(spec, port)?,
                None => {
                    return Err(RtpProxyError::invalid_spec(
                        spec,
                        "unexpected data after closing bracket",
                    ))
                }
            },
        };
        if host.is_empty() {
            return Err(RtpProxyError::invalid_spec(spec, "empty host"));
        }
        return Ok((host.to_string(), port));
    }

    if rest.parse::<Ipv6Addr>().is_ok() {
        return Ok((rest.to_string(), DEFAULT_RTPP_PORT));
    }

    let (host, port) = match rest.rfind(':') {
        Some(idx) => (&rest[..idx], parse_port(spec, &rest[idx + 1..])?),
        None => (rest, DEFAULT_RTPP_PORT),
    };
    if host.is_empty() {
        return Err(RtpProxyError::invalid_spec(spec, "empty host"));
    }
    Ok((host.to_string(), port))
}

fn parse_port(spec: &str, port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) => Err(RtpProxyError::invalid_spec(spec, "port must be non-zero")),
        Ok(port) => Ok(port),
        Err(_) => Err(RtpProxyError::invalid_spec(
            spec,
            format!("invalid port '{}'", port),
        )),
    }
}

/// Resolve a relay spec or explicit address into an endpoint
///
/// `sip_address` is the local signaling address. It is reported as the
/// proxy address for unix-domain relays, whose socket path means nothing
/// to a remote media endpoint.
pub async fn resolve(spec: &ProxySpec, sip_address: &str) -> Result<ResolvedEndpoint> {
    match spec {
        ProxySpec::Spec(text) => {
            let parsed = parse_spec(text)?;
            resolve_parsed(parsed, sip_address).await
        }
        ProxySpec::Address(address) => Ok(resolve_address(address, sip_address)),
    }
}

/// Resolve an already parsed spec
pub async fn resolve_parsed(parsed: ParsedSpec, sip_address: &str) -> Result<ResolvedEndpoint> {
    let resolved = match parsed.target {
        SpecTarget::Path(path) => ResolvedEndpoint {
            kind: parsed.kind,
            endpoint: Endpoint::Unix(path),
            proxy_address: sip_address.to_string(),
        },
        SpecTarget::Host { host, port } => {
            let addr = lookup(&host, port, parsed.kind.requires_ipv6()).await?;
            ResolvedEndpoint {
                kind: parsed.kind,
                endpoint: Endpoint::Inet(addr),
                proxy_address: addr.ip().to_string(),
            }
        }
    };
    debug!("Resolved RTP proxy endpoint {}", resolved);
    Ok(resolved)
}

fn resolve_address(address: &ProxyAddress, sip_address: &str) -> ResolvedEndpoint {
    match address {
        ProxyAddress::Udp(addr) => ResolvedEndpoint {
            kind: if addr.is_ipv6() { TransportKind::Udp6 } else { TransportKind::Udp },
            endpoint: Endpoint::Inet(*addr),
            proxy_address: addr.ip().to_string(),
        },
        ProxyAddress::Tcp(addr) => ResolvedEndpoint {
            kind: if addr.is_ipv6() { TransportKind::Tcp6 } else { TransportKind::Tcp },
            endpoint: Endpoint::Inet(*addr),
            proxy_address: addr.ip().to_string(),
        },
        ProxyAddress::Unix(path) => ResolvedEndpoint {
            kind: TransportKind::ConnectedUnix,
            endpoint: Endpoint::Unix(path.clone()),
            proxy_address: sip_address.to_string(),
        },
    }
}

async fn lookup(host: &str, port: u16, ipv6: bool) -> Result<SocketAddr> {
    let family = if ipv6 { "IPv6" } else { "IPv4" };

    if let Ok(ip) = host.parse::<IpAddr>() {
        if ipv6 && ip.is_ipv4() {
            return Err(RtpProxyError::NoAddress {
                host: host.to_string(),
                family,
            });
        }
        return Ok(SocketAddr::new(ip, port));
    }

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| RtpProxyError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    let chosen = if ipv6 {
        candidates.iter().find(|a| a.is_ipv6()).copied()
    } else {
        candidates
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
    };

    chosen.ok_or_else(|| RtpProxyError::NoAddress {
        host: host.to_string(),
        family,
    })
}

/// Unspecified local address of the same family as `remote`
pub(crate) fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_of(parsed: &ParsedSpec) -> (&str, u16) {
        match &parsed.target {
            SpecTarget::Host { host, port } => (host.as_str(), *port),
            SpecTarget::Path(_) => panic!("expected host target"),
        }
    }

    #[test]
    fn test_prefixes_select_kind() {
        let cases = [
            ("udp:10.0.0.1", TransportKind::Udp),
            ("udp6:::1", TransportKind::Udp6),
            ("tcp:10.0.0.1:9000", TransportKind::Tcp),
            ("tcp6:[::1]:9000", TransportKind::Tcp6),
            ("unix:/var/run/rtpproxy.sock", TransportKind::Unix),
            ("cunix:/var/run/rtpproxy.sock", TransportKind::ConnectedUnix),
            ("/var/run/rtpproxy.sock", TransportKind::Unix),
        ];
        for (spec, kind) in cases {
            assert_eq!(parse_spec(spec).unwrap().kind, kind, "spec {}", spec);
        }
    }

    #[test]
    fn test_default_port_only_when_omitted() {
        assert_eq!(host_of(&parse_spec("udp:10.0.0.1").unwrap()), ("10.0.0.1", 22222));
        assert_eq!(host_of(&parse_spec("udp:10.0.0.1:7000").unwrap()), ("10.0.0.1", 7000));
        assert_eq!(host_of(&parse_spec("tcp:relay.example.net").unwrap()), ("relay.example.net", 22222));
        assert_eq!(host_of(&parse_spec("tcp:relay.example.net:22223").unwrap()), ("relay.example.net", 22223));
    }

    #[test]
    fn test_ipv6_literals() {
        assert_eq!(host_of(&parse_spec("udp6:2001:db8::1").unwrap()), ("2001:db8::1", 22222));
        assert_eq!(host_of(&parse_spec("udp6:[2001:db8::1]:5060").unwrap()), ("2001:db8::1", 5060));
        assert_eq!(host_of(&parse_spec("udp6:[2001:db8::1]").unwrap()), ("2001:db8::1", 22222));
        assert_eq!(host_of(&parse_spec("tcp6:relay6.example.net:4000").unwrap()), ("relay6.example.net", 4000));
    }

    #[test]
    fn test_unix_paths() {
        let parsed = parse_spec("cunix:/tmp/rtpp.sock").unwrap();
        assert_eq!(parsed.target, SpecTarget::Path(PathBuf::from("/tmp/rtpp.sock")));

        let parsed = parse_spec("/tmp/rtpp.sock").unwrap();
        assert_eq!(parsed.target, SpecTarget::Path(PathBuf::from("/tmp/rtpp.sock")));
    }

    #[test]
    fn test_malformed_specs() {
        for spec in ["", "unix:", "udp:", "udp:10.0.0.1:notaport", "udp:10.0.0.1:0",
                     "udp6:[2001:db8::1", "udp6:[2001:db8::1]5060", "tcp:10.0.0.1:1:2"] {
            let err = parse_spec(spec).unwrap_err();
            assert!(err.is_configuration(), "spec '{}' gave {:?}", spec, err);
        }
    }

    #[tokio::test]
    async fn test_resolve_reports_relay_host_for_inet() {
        let resolved = resolve(&ProxySpec::Spec("udp:127.0.0.1:7000".into()), "192.0.2.10")
            .await
            .unwrap();
        assert_eq!(resolved.endpoint, Endpoint::Inet("127.0.0.1:7000".parse().unwrap()));
        assert_eq!(resolved.proxy_address, "127.0.0.1");

        let resolved = resolve(&ProxySpec::Spec("tcp6:[::1]".into()), "192.0.2.10")
            .await
            .unwrap();
        assert_eq!(resolved.endpoint, Endpoint::Inet("[::1]:22222".parse().unwrap()));
        assert_eq!(resolved.proxy_address, "::1");
    }

    #[tokio::test]
    async fn test_resolve_reports_sip_address_for_unix() {
        let resolved = resolve(&ProxySpec::Spec("unix:/tmp/rtpp.sock".into()), "192.0.2.10")
            .await
            .unwrap();
        assert_eq!(resolved.kind, TransportKind::Unix);
        assert_eq!(resolved.proxy_address, "192.0.2.10");
    }

    #[tokio::test]
    async fn test_resolve_explicit_address() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let resolved = resolve(&ProxySpec::Address(ProxyAddress::Udp(addr)), "192.0.2.10")
            .await
            .unwrap();
        assert_eq!(resolved.kind, TransportKind::Udp6);
        assert_eq!(resolved.proxy_address, "::1");
    }

    #[tokio::test]
    async fn test_resolve_family_mismatch_is_error() {
        let err = resolve(&ProxySpec::Spec("udp6:127.0.0.1".into()), "192.0.2.10")
            .await
            .unwrap_err();
        assert!(matches!(err, RtpProxyError::NoAddress { family: "IPv6", .. }));
    }
}
