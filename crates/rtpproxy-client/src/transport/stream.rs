//! Stream control transport
//!
//! Serves TCP relays and unix-domain relays. A fixed pool of workers pulls
//! commands from one shared queue, writes each as a single line and reads
//! until the reply ends in a newline. `unix:` relays get a fresh connection
//! per command; TCP and `cunix:` relays keep one connection per worker and
//! reconnect lazily after a failure. Anything already readable on a reused
//! connection is discarded before the next command is written.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::address::{Endpoint, ResolvedEndpoint, TransportKind};
use crate::config::RtpProxyConfig;
use crate::error::{Result, RtpProxyError};
use super::{ReplyCallback, RtpProxyTransport, RttEstimator};

// Read chunk size for replies
const READ_CHUNK_SIZE: usize = 4096;

// Workers are spawned onto the runtime, so the boxed stream must be `Sync`
// for `&Worker` to stay `Send` across awaits
trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ControlStream for T {}

struct QueuedCommand {
    command: String,
    callback: ReplyCallback,
}

type CommandQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedCommand>>>;

/// Stream transport for relay control commands
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamTransportInner>,
}

// Dropping the last handle closes the queue, which stops the workers
struct StreamTransportInner {
    kind: TransportKind,
    endpoint: Endpoint,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<QueuedCommand>>>,
    shared: Arc<WorkerShared>,
}

#[derive(Default)]
struct WorkerShared {
    closed: AtomicBool,
    rtt: RttEstimator,
}

impl StreamTransport {
    /// Start the worker pool for the given relay endpoint
    ///
    /// No connection is made until the first command is submitted.
    pub fn new(endpoint: &ResolvedEndpoint, config: &RtpProxyConfig) -> Result<Self> {
        if endpoint.kind.is_datagram() {
            return Err(RtpProxyError::config(format!(
                "stream transport cannot serve {} relays",
                endpoint.kind
            )));
        }
        #[cfg(not(unix))]
        if endpoint.kind.is_unix() {
            return Err(RtpProxyError::config(
                "unix-domain relays are not supported on this platform",
            ));
        }

        let handle = Handle::try_current()
            .map_err(|e| RtpProxyError::config(format!("No tokio runtime available: {}", e)))?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue: CommandQueue = Arc::new(tokio::sync::Mutex::new(queue_rx));

        let transport = StreamTransport {
            inner: Arc::new(StreamTransportInner {
                kind: endpoint.kind,
                endpoint: endpoint.endpoint.clone(),
                queue_tx: Mutex::new(Some(queue_tx)),
                shared: Arc::new(WorkerShared::default()),
            }),
        };

        let nworkers = config.workers();
        let reconnect_delay = config.stream_reconnect_delay();
        for id in 0..nworkers {
            let worker = Worker {
                id,
                kind: endpoint.kind,
                endpoint: endpoint.endpoint.clone(),
                shared: transport.inner.shared.clone(),
                queue: queue.clone(),
                connection: None,
                reconnect_delay,
            };
            handle.spawn(worker.run());
        }

        info!(
            "RTP proxy {} transport to {} started with {} worker(s)",
            endpoint.kind, endpoint.endpoint, nworkers
        );

        Ok(transport)
    }
}

struct Worker {
    id: usize,
    kind: TransportKind,
    endpoint: Endpoint,
    shared: Arc<WorkerShared>,
    queue: CommandQueue,
    connection: Option<Box<dyn ControlStream>>,
    reconnect_delay: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some(QueuedCommand { command, callback }) = next else { break };

            if self.shared.closed.load(Ordering::Relaxed) {
                callback(None);
                continue;
            }

            let started = Instant::now();
            match self.exchange(&command).await {
                Ok(reply) => {
                    self.shared.rtt.update(started.elapsed());
                    debug!("RTP proxy reply to {:?}: {:?}", command, reply);
                    callback(Some(reply));
                }
                Err(e) => {
                    warn!(
                        "Worker {} failed to exchange {:?} with RTP proxy {}: {}",
                        self.id, command, self.endpoint, e
                    );
                    self.connection = None;
                    callback(None);
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
        debug!("RTP proxy stream worker {} terminated", self.id);
    }

    async fn exchange(&mut self, command: &str) -> io::Result<String> {
        let mut stream = match self.connection.take() {
            Some(mut stream) => match drain_stale(&mut stream).await {
                Ok(0) => stream,
                Ok(n) => {
                    warn!(
                        "Worker {} discarded {} stale byte(s) from RTP proxy {}",
                        self.id, n, self.endpoint
                    );
                    stream
                }
                Err(e) => {
                    debug!("Worker {} reconnecting to RTP proxy {}: {}", self.id, self.endpoint, e);
                    self.connect().await?
                }
            },
            None => self.connect().await?,
        };

        trace!("Sending to RTP proxy {}: {:?}", self.endpoint, command);
        stream.write_all(format!("{}\n", command).as_bytes()).await?;
        let reply = read_reply(&mut stream).await?;

        if self.kind != TransportKind::Unix {
            self.connection = Some(stream);
        }
        Ok(reply)
    }

    async fn connect(&self) -> io::Result<Box<dyn ControlStream>> {
        let stream: Box<dyn ControlStream> = match &self.endpoint {
            Endpoint::Inet(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("cannot connect to unix socket {}", path.display()),
                ))
            }
        };
        trace!("Worker {} connected to RTP proxy {}", self.id, self.endpoint);
        Ok(stream)
    }
}

// Discards whatever is already readable on a reused connection, such as
// the tail of an earlier reply that arrived after its newline. Fails if
// the relay has closed the connection.
async fn drain_stale<S: AsyncRead + Unpin + ?Sized>(stream: &mut S) -> io::Result<usize> {
    let mut drained = 0;
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let ready = poll_fn(|cx| {
            let mut buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut *stream).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(Some(buf.filled().len()))),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Ready(Ok(None)),
            }
        })
        .await?;

        match ready {
            Some(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by RTP proxy",
                ))
            }
            Some(n) => {
                trace!("Discarding stale data: {:?}", String::from_utf8_lossy(&chunk[..n]));
                drained += n;
            }
            None => return Ok(drained),
        }
    }
}

// Reads until the accumulated data ends in a newline, or until the relay
// closes a connection that already carried some data.
async fn read_reply<S: AsyncRead + Unpin + ?Sized>(stream: &mut S) -> io::Result<String> {
    let mut data = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if data.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by RTP proxy",
                ));
            }
            break;
        }
        data.extend_from_slice(&chunk[..n]);
        if data.ends_with(b"\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&data).trim().to_string())
}

impl RtpProxyTransport for StreamTransport {
    fn send_command(&self, command: &str, callback: ReplyCallback) {
        if self.inner.shared.closed.load(Ordering::Relaxed) {
            callback(None);
            return;
        }

        let queued = QueuedCommand {
            command: command.to_string(),
            callback,
        };
        let result = match self.inner.queue_tx.lock().as_ref() {
            Some(tx) => tx.send(queued).map_err(|e| e.0),
            None => Err(queued),
        };
        if let Err(queued) = result {
            (queued.callback)(None);
        }
    }

    fn is_local(&self) -> bool {
        self.inner.kind.is_unix()
    }

    fn shutdown(&self) {
        if self.inner.shared.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        // Workers drain what is already queued with failures and then exit
        self.inner.queue_tx.lock().take();
        info!("RTP proxy stream transport for {} shut down", self.inner.endpoint);
    }

    fn rtpc_delay(&self) -> Option<Duration> {
        self.inner.shared.rtt.get()
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamTransport({}:{})", self.inner.kind, self.inner.endpoint)
    }
}
