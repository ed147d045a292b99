//! RTP proxy client controller
//!
//! [`RtpProxyClient`] owns the control connection to one relay and runs the
//! state machine that keeps track of whether the relay can be used:
//!
//! ```text
//!            version "20040107"             heartbeat failure or
//!  Offline ───────────────────────▶ Online ─────────────────────▶ Offline
//!     ▲ │                             │       version mismatch       │
//!     │ └── other reply: retry V ─┐   │                              │
//!     └───────────────────────────┘   └── Ib every interval          └── retry V after jitter
//!
//!  any state ── shutdown() ──▶ ShutDown   (absorbing)
//! ```
//!
//! Everything is driven by reply callbacks and one-shot timers that
//! reschedule themselves. Each handler starts by checking for `ShutDown`,
//! so a callback or timer that fires after shutdown does nothing.
//!
//! The client goes online before capability discovery has finished. Code
//! that depends on a capability flag should check [`RtpProxyClient::caps_done`]
//! first, otherwise it may observe a flag that has not been probed yet.
//!
//! There is no per-command timeout at this layer: a relay that accepts a
//! command and never answers stalls that command's callback. Datagram
//! relays are covered by the retransmission budget of the UDP transport.

pub mod caps;
pub mod stats;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::address::{self, ProxyAddress, ProxySpec};
use crate::config::RtpProxyConfig;
use crate::error::{Result, RtpProxyError};
use crate::events::{self, RtpProxyEvent};
use crate::timer::{randomize, Scheduler, TokioScheduler};
use crate::transport::{self, ReplyCallback, RtpProxyTransport};

use caps::{Capabilities, Capability, CapsChecker, CAPABILITY_TABLE};
use stats::HeartbeatStats;

/// The only control protocol version this client speaks
pub const SUPPORTED_VERSION: &str = "20040107";

/// Version handshake command
pub const VERSION_COMMAND: &str = "V";

/// Heartbeat and statistics command
pub const HEARTBEAT_COMMAND: &str = "Ib";

/// Lifecycle state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Offline,
    Online,
    /// Terminal; no other state is entered afterwards
    ShutDown,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Online => write!(f, "online"),
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}

/// Control-plane client for one RTP proxy relay
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct RtpProxyClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Released exactly once, by shutdown
    transport: Mutex<Option<Arc<dyn RtpProxyTransport>>>,
    is_local: bool,
    scheduler: Arc<dyn Scheduler>,
    proxy_address: String,
    heartbeat_interval: Duration,
    version_retry_interval: Duration,
    jitter: f64,
    state: Mutex<ClientState>,
    events: broadcast::Sender<RtpProxyEvent>,
}

struct ClientState {
    status: ClientStatus,
    /// Bumped on every Offline -> Online transition; heartbeat ticks and
    /// capability replies from an earlier online period are discarded
    epoch: u64,
    caps: Capabilities,
    caps_done: bool,
    caps_checker: Option<CapsChecker>,
    stats: Option<HeartbeatStats>,
    /// A version check retry timer is armed; at most one exists at a time
    retry_pending: bool,
}

impl RtpProxyClient {
    /// Create a client for the relay named by `config.spec_path`
    pub async fn new(config: RtpProxyConfig) -> Result<Self> {
        let spec = config
            .spec_path
            .clone()
            .ok_or_else(|| RtpProxyError::config("spec_path is required"))?;
        Self::connect(ProxySpec::Spec(spec), config).await
    }

    /// Create a client for an already resolved relay address
    pub async fn with_address(address: ProxyAddress, config: RtpProxyConfig) -> Result<Self> {
        Self::connect(ProxySpec::Address(address), config).await
    }

    async fn connect(spec: ProxySpec, config: RtpProxyConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = address::resolve(&spec, &config.sip_address).await?;
        let transport = transport::create_transport(&endpoint, &config).await?;
        let scheduler = Arc::new(TokioScheduler::current()?);

        info!(
            "Created RTP proxy client for {} (advertised as {})",
            endpoint, endpoint.proxy_address
        );

        Self::with_transport(transport, endpoint.proxy_address, &config, scheduler)
    }

    /// Create a client on top of a caller supplied transport and scheduler
    ///
    /// Starts the version handshake right away, unless the configuration
    /// disables it, in which case the client is online immediately.
    /// Fails if `config` does not pass [`RtpProxyConfig::validate`].
    pub fn with_transport(
        transport: Arc<dyn RtpProxyTransport>,
        proxy_address: impl Into<String>,
        config: &RtpProxyConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Self {
            inner: Arc::new(ClientInner {
                is_local: transport.is_local(),
                transport: Mutex::new(Some(transport)),
                scheduler,
                proxy_address: proxy_address.into(),
                heartbeat_interval: config.heartbeat_interval(),
                version_retry_interval: config.version_retry_interval(),
                jitter: config.jitter,
                state: Mutex::new(ClientState {
                    status: ClientStatus::Offline,
                    epoch: 0,
                    caps: Capabilities::default(),
                    caps_done: false,
                    caps_checker: None,
                    stats: None,
                    retry_pending: false,
                }),
                events: events::channel(),
            }),
        };

        if config.no_version_check {
            client.inner.force_online();
        } else {
            client.inner.version_check();
        }

        Ok(client)
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<RtpProxyEvent> {
        self.inner.events.subscribe()
    }

    /// Send an arbitrary command to the relay
    ///
    /// Valid in any state. Replies received before the handshake completes
    /// are for the caller to interpret. After shutdown the callback receives
    /// `None` without any network activity.
    pub fn send_command<F>(&self, command: &str, callback: F)
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        self.inner.send(command, Box::new(callback));
    }

    /// Send a command and wait for its reply
    pub async fn command(&self, command: &str) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.send_command(command, move |reply| {
            let _ = tx.send(reply);
        });
        rx.await.ok().flatten()
    }

    /// Wait until the client is online, giving up at `deadline`
    ///
    /// Returns whether the client is online when the wait ends.
    pub async fn wait_online(&self, deadline: Instant) -> bool {
        self.wait_for(deadline, Self::is_online).await
    }

    /// Wait until capability discovery of the current online period has
    /// finished, giving up at `deadline`
    pub async fn wait_capabilities(&self, deadline: Instant) -> bool {
        self.wait_for(deadline, Self::caps_done).await
    }

    async fn wait_for(&self, deadline: Instant, ready: fn(&Self) -> bool) -> bool {
        // Subscribe before checking so a transition in between is not missed
        let mut events = self.subscribe();
        if ready(self) {
            return true;
        }

        let _ = timeout_at(deadline, async {
            loop {
                match events.recv().await {
                    Ok(RtpProxyEvent::ShutDown) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if ready(self) {
                            break;
                        }
                    }
                }
            }
        })
        .await;

        ready(self)
    }

    /// Issue the version handshake
    ///
    /// Useful while online to confirm the relay still speaks the expected
    /// protocol. While offline with a retry already armed, a failed check
    /// does not start a second retry timer.
    pub fn version_check(&self) {
        self.inner.version_check();
    }

    /// Mark the relay usable, start capability discovery and heartbeats
    ///
    /// Does nothing if the client is already online or shut down.
    pub fn go_online(&self) {
        self.inner.go_online();
    }

    /// Mark the relay unusable and schedule a reconnection attempt
    ///
    /// Does nothing unless the client is online.
    pub fn go_offline(&self) {
        self.inner.go_offline();
    }

    /// Stop all activity and release the transport
    ///
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.state.lock().status
    }

    pub fn is_online(&self) -> bool {
        self.status() == ClientStatus::Online
    }

    pub fn is_shut_down(&self) -> bool {
        self.status() == ClientStatus::ShutDown
    }

    /// Whether the relay runs on this host
    pub fn is_local(&self) -> bool {
        self.inner.is_local
    }

    /// Address to advertise to the media plane for this relay
    pub fn proxy_address(&self) -> &str {
        &self.inner.proxy_address
    }

    /// Whether every capability probe of the current online period was answered
    pub fn caps_done(&self) -> bool {
        self.inner.state.lock().caps_done
    }

    /// Number of capability probes still awaiting a reply, if discovery is running
    pub fn pending_capability_probes(&self) -> Option<usize> {
        self.inner.state.lock().caps_checker.as_ref().map(CapsChecker::pending)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.state.lock().caps
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().get(capability)
    }

    pub fn sbind_supported(&self) -> bool {
        self.supports(Capability::SBind)
    }

    pub fn tnot_supported(&self) -> bool {
        self.supports(Capability::TNot)
    }

    pub fn copy_supported(&self) -> bool {
        self.supports(Capability::Copy)
    }

    pub fn stat_supported(&self) -> bool {
        self.supports(Capability::Stat)
    }

    pub fn wdnt_supported(&self) -> bool {
        self.supports(Capability::Wdnt)
    }

    /// Statistics from the last heartbeat, `None` while unknown
    pub fn stats(&self) -> Option<HeartbeatStats> {
        self.inner.state.lock().stats
    }

    /// Smoothed command round-trip time reported by the transport
    pub fn rtpc_delay(&self) -> Option<Duration> {
        self.inner
            .transport
            .lock()
            .as_ref()
            .and_then(|transport| transport.rtpc_delay())
    }
}

impl fmt::Debug for RtpProxyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpProxyClient")
            .field("proxy_address", &self.inner.proxy_address)
            .field("status", &self.status())
            .finish()
    }
}

// The state lock is never held while calling into the transport or the
// scheduler: either may run the callback synchronously.
impl ClientInner {
    fn send(&self, command: &str, callback: ReplyCallback) {
        let transport = self.transport.lock().clone();
        match transport {
            Some(transport) => {
                debug!("Sending command {:?} to RTP proxy {}", command, self.proxy_address);
                transport.send_command(command, callback);
            }
            None => callback(None),
        }
    }

    fn emit(&self, event: RtpProxyEvent) {
        let _ = self.events.send(event);
    }

    fn force_online(self: &Arc<Self>) {
        let epoch = {
            let mut state = self.state.lock();
            state.status = ClientStatus::Online;
            state.caps_done = true;
            state.epoch += 1;
            state.epoch
        };
        info!("RTP proxy {} online without version check", self.proxy_address);
        self.emit(RtpProxyEvent::Online {
            proxy_address: self.proxy_address.clone(),
        });
        self.heartbeat(epoch);
    }

    fn version_check(self: &Arc<Self>) {
        if self.state.lock().status == ClientStatus::ShutDown {
            return;
        }
        let weak = Arc::downgrade(self);
        self.send(
            VERSION_COMMAND,
            Box::new(move |reply| {
                if let Some(inner) = weak.upgrade() {
                    inner.version_check_reply(reply.as_deref());
                }
            }),
        );
    }

    fn version_check_reply(self: &Arc<Self>, reply: Option<&str>) {
        let status = self.state.lock().status;
        if status == ClientStatus::ShutDown {
            return;
        }

        if reply.map(str::trim) == Some(SUPPORTED_VERSION) {
            self.go_online();
        } else if status == ClientStatus::Online {
            warn!(
                "RTP proxy {} replied {:?} to version check, expected {}",
                self.proxy_address, reply, SUPPORTED_VERSION
            );
            self.go_offline();
        } else {
            debug!(
                "RTP proxy {} not ready (version reply {:?}), will retry",
                self.proxy_address, reply
            );
            self.schedule_version_check();
        }
    }

    fn schedule_version_check(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.retry_pending {
                debug!("Version check of RTP proxy {} already scheduled", self.proxy_address);
                return;
            }
            state.retry_pending = true;
        }

        let delay = randomize(self.version_retry_interval, self.jitter);
        let weak = Arc::downgrade(self);
        debug!("Next version check of RTP proxy {} in {:?}", self.proxy_address, delay);
        self.scheduler.schedule_once(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.state.lock().retry_pending = false;
                    inner.version_check();
                }
            }),
        );
    }

    fn go_online(self: &Arc<Self>) {
        let epoch = {
            let mut state = self.state.lock();
            if state.status != ClientStatus::Offline {
                return;
            }
            state.status = ClientStatus::Online;
            state.epoch += 1;
            state.caps_done = false;
            state.caps_checker = Some(CapsChecker::new(state.epoch));
            state.epoch
        };

        info!("RTP proxy {} is online", self.proxy_address);
        self.emit(RtpProxyEvent::Online {
            proxy_address: self.proxy_address.clone(),
        });

        self.probe_capabilities(epoch);
        self.heartbeat(epoch);
    }

    fn go_offline(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status != ClientStatus::Online {
                return;
            }
            state.status = ClientStatus::Offline;
            state.stats = None;
        }

        warn!("RTP proxy {} is offline", self.proxy_address);
        self.emit(RtpProxyEvent::Offline {
            proxy_address: self.proxy_address.clone(),
        });

        self.schedule_version_check();
    }

    fn probe_capabilities(self: &Arc<Self>, epoch: u64) {
        for (_, capability) in CAPABILITY_TABLE {
            let weak = Arc::downgrade(self);
            self.send(
                &capability.probe_command(),
                Box::new(move |reply| {
                    if let Some(inner) = weak.upgrade() {
                        inner.caps_reply(epoch, capability, reply.as_deref());
                    }
                }),
            );
        }
    }

    fn caps_reply(&self, epoch: u64, capability: Capability, reply: Option<&str>) {
        let caps = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.status == ClientStatus::ShutDown {
                return;
            }

            let done = match state.caps_checker.as_mut() {
                Some(checker) if checker.epoch() == epoch => {
                    checker.record(&mut state.caps, capability, reply)
                }
                _ => {
                    debug!("Ignoring stale {} capability reply", capability);
                    return;
                }
            };
            if !done {
                return;
            }

            state.caps_checker = None;
            state.caps_done = true;
            state.caps
        };

        info!("RTP proxy {} capabilities: {:?}", self.proxy_address, caps);
        self.emit(RtpProxyEvent::CapabilitiesDiscovered(caps));
    }

    fn heartbeat(self: &Arc<Self>, epoch: u64) {
        {
            let state = self.state.lock();
            if state.status != ClientStatus::Online || state.epoch != epoch {
                return;
            }
        }

        let weak = Arc::downgrade(self);
        self.send(
            HEARTBEAT_COMMAND,
            Box::new(move |reply| {
                if let Some(inner) = weak.upgrade() {
                    inner.heartbeat_reply(epoch, reply);
                }
            }),
        );
    }

    fn heartbeat_reply(self: &Arc<Self>, epoch: u64, reply: Option<String>) {
        let stats = {
            let mut state = self.state.lock();
            if state.status != ClientStatus::Online || state.epoch != epoch {
                return;
            }
            let Some(text) = reply else {
                drop(state);
                warn!("Heartbeat to RTP proxy {} failed", self.proxy_address);
                self.go_offline();
                return;
            };
            let stats = HeartbeatStats::parse(&text);
            state.stats = Some(stats);
            stats
        };

        self.emit(RtpProxyEvent::Stats(stats));
        self.schedule_heartbeat(epoch);
    }

    fn schedule_heartbeat(self: &Arc<Self>, epoch: u64) {
        let delay = randomize(self.heartbeat_interval, self.jitter);
        let weak = Arc::downgrade(self);
        self.scheduler.schedule_once(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.heartbeat(epoch);
                }
            }),
        );
    }

    fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.status == ClientStatus::ShutDown {
                return;
            }
            state.status = ClientStatus::ShutDown;
            state.caps_checker = None;
        }

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.shutdown();
        }

        info!("RTP proxy client for {} shut down", self.proxy_address);
        self.emit(RtpProxyEvent::ShutDown);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.get_mut().take() {
            transport.shutdown();
        }
    }
}
