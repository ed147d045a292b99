//! Datagram control transport
//!
//! Every command travels in its own datagram prefixed with a cookie, and the
//! relay echoes the cookie in front of its reply. Replies are matched by
//! cookie, so they may arrive in any order. Lost datagrams are retransmitted
//! with a doubling interval until the retry budget runs out.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::address::{unspecified_for, Endpoint, ResolvedEndpoint};
use crate::config::RtpProxyConfig;
use crate::error::{Result, RtpProxyError};
use super::{ReplyCallback, RtpProxyTransport, RttEstimator};

// Buffer size for receiving replies
const UDP_BUFFER_SIZE: usize = 8192;

/// UDP transport for relay control commands
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    handle: Handle,
    cookie_prefix: u32,
    next_cookie: AtomicU64,
    pending: Mutex<HashMap<String, PendingCommand>>,
    closed: AtomicBool,
    retransmit_interval: Duration,
    max_retransmits: u32,
    rtt: RttEstimator,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

struct PendingCommand {
    callback: ReplyCallback,
    sent_at: Instant,
    retransmitted: bool,
}

impl UdpTransport {
    /// Bind a control socket for the given relay endpoint
    pub async fn bind(endpoint: &ResolvedEndpoint, config: &RtpProxyConfig) -> Result<Self> {
        let remote = match &endpoint.endpoint {
            Endpoint::Inet(addr) => *addr,
            Endpoint::Unix(path) => {
                return Err(RtpProxyError::config(format!(
                    "UDP transport cannot reach unix socket {}",
                    path.display()
                )))
            }
        };

        let local = config.bind_address.unwrap_or_else(|| unspecified_for(&remote));
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| RtpProxyError::Bind { addr: local, source })?;
        info!(
            "RTP proxy UDP control socket bound to {} for relay {}",
            socket.local_addr()?,
            remote
        );

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket: Arc::new(socket),
                remote,
                handle: Handle::current(),
                cookie_prefix: rand::thread_rng().gen(),
                next_cookie: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                retransmit_interval: config.udp_retransmit_interval(),
                max_retransmits: config.udp_max_retransmits,
                rtt: RttEstimator::default(),
                receive_task: Mutex::new(None),
            }),
        };

        transport.spawn_receive_loop();

        Ok(transport)
    }

    /// Local address of the control socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.socket.local_addr().map_err(RtpProxyError::from)
    }

    /// Number of commands still waiting for a reply
    pub fn pending_commands(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn spawn_receive_loop(&self) {
        let socket = self.inner.socket.clone();
        let weak = Arc::downgrade(&self.inner);

        let task = self.inner.handle.spawn(async move {
            let mut buffer = vec![0u8; UDP_BUFFER_SIZE];

            loop {
                let result = socket.recv_from(&mut buffer).await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Relaxed) {
                    break;
                }

                let (len, src) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Error receiving from RTP proxy {}: {}", inner.remote, e);
                        continue;
                    }
                };

                if src != inner.remote {
                    trace!("Ignoring datagram from unexpected source {}", src);
                    continue;
                }

                let text = String::from_utf8_lossy(&buffer[..len]);
                trace!("Received from RTP proxy {}: {:?}", src, text);
                inner.dispatch_reply(&text);
            }

            debug!("RTP proxy UDP receive loop terminated");
        });

        *self.inner.receive_task.lock() = Some(task);
    }
}

impl UdpTransportInner {
    fn dispatch_reply(&self, data: &str) {
        let data = data.trim_end();
        let (cookie, body) = match data.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((cookie, body)) => (cookie, body.trim_start()),
            None => (data, ""),
        };

        let entry = self.pending.lock().remove(cookie);
        match entry {
            Some(pending) => {
                if !pending.retransmitted {
                    self.rtt.update(pending.sent_at.elapsed());
                }
                debug!("RTP proxy reply for {}: {:?}", cookie, body);
                (pending.callback)(Some(body.to_string()));
            }
            None => debug!("Dropping RTP proxy reply with unknown cookie '{}'", cookie),
        }
    }

    async fn transmit(weak: Weak<Self>, cookie: String, payload: String) {
        let mut attempt = 0u32;
        let mut interval = match weak.upgrade() {
            Some(inner) => inner.retransmit_interval,
            None => return,
        };

        loop {
            {
                let Some(inner) = weak.upgrade() else { return };
                if inner.closed.load(Ordering::Relaxed) {
                    return;
                }
                trace!("Sending to RTP proxy {}: {:?}", inner.remote, payload);
                if let Err(e) = inner.socket.send_to(payload.as_bytes(), inner.remote).await {
                    warn!("Failed to send command to RTP proxy {}: {}", inner.remote, e);
                }
            }

            tokio::time::sleep(interval).await;

            let Some(inner) = weak.upgrade() else { return };
            let expired = {
                let mut pending = inner.pending.lock();
                if attempt >= inner.max_retransmits {
                    match pending.remove(&cookie) {
                        Some(entry) => Some(entry),
                        None => return,
                    }
                } else {
                    match pending.get_mut(&cookie) {
                        Some(entry) => entry.retransmitted = true,
                        None => return,
                    }
                    None
                }
            };

            if let Some(entry) = expired {
                warn!(
                    "RTP proxy {} did not answer command {} after {} retransmissions",
                    inner.remote, cookie, attempt
                );
                (entry.callback)(None);
                return;
            }

            attempt += 1;
            interval *= 2;
            debug!("Retransmitting command {} to RTP proxy {} (attempt {})", cookie, inner.remote, attempt);
        }
    }
}

impl Drop for UdpTransportInner {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.get_mut().take() {
            task.abort();
        }
    }
}

impl RtpProxyTransport for UdpTransport {
    fn send_command(&self, command: &str, callback: ReplyCallback) {
        if self.inner.closed.load(Ordering::Relaxed) {
            callback(None);
            return;
        }

        let cookie = format!(
            "{:08x}_{}",
            self.inner.cookie_prefix,
            self.inner.next_cookie.fetch_add(1, Ordering::Relaxed)
        );
        let payload = format!("{} {}", cookie, command);

        self.inner.pending.lock().insert(
            cookie.clone(),
            PendingCommand {
                callback,
                sent_at: Instant::now(),
                retransmitted: false,
            },
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .handle
            .spawn(UdpTransportInner::transmit(weak, cookie, payload));
    }

    fn is_local(&self) -> bool {
        false
    }

    fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }

        if let Some(task) = self.inner.receive_task.lock().take() {
            task.abort();
        }

        let drained: Vec<PendingCommand> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            (pending.callback)(None);
        }

        info!("RTP proxy UDP transport for {} shut down", self.inner.remote);
    }

    fn rtpc_delay(&self) -> Option<Duration> {
        self.inner.rtt.get()
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(addr) = self.inner.socket.local_addr() {
            write!(f, "UdpTransport({} -> {})", addr, self.inner.remote)
        } else {
            write!(f, "UdpTransport(<error> -> {})", self.inner.remote)
        }
    }
}
