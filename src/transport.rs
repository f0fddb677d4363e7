//! TCP transport with length-prefixed frames.
//!
//! [`Listener`] hands out accepted [`Connection`]s; [`Link`] is the connecting
//! side and keeps a supervisor task that (re)establishes the session while
//! callers keep enqueuing frames. Both expose the same pair of primitives:
//! `send(frame, wait)` and `receive(wait)`.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::ErrorKind,
    net::SocketAddr,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, error::SendTimeoutError},
        watch,
    },
    time::{sleep, timeout},
};
use tokio_util::{
    codec::Framed,
    sync::{CancellationToken, DropGuard},
};
use tracing::{debug, info, warn};

use crate::{
    errors::{TransportError, WireError},
    wire::{Frame, FrameCodec, DEFAULT_MAX_FRAME_LENGTH},
};

const SCHEME: &str = "tcp://";
const ANY_HOST: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub max_frame_length: usize,

    pub outbound_buffer: usize,

    pub inbound_buffer: usize,

    pub connect_timeout: Duration,

    pub reconnect_interval: Duration,

    pub max_reconnect_attempts: u32,

    pub send_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            outbound_buffer: 1024,
            inbound_buffer: 1024,
            connect_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_millis(100),
            max_reconnect_attempts: 10,
            send_timeout: Duration::from_secs(1),
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    pub fn with_outbound_buffer(mut self, frames: usize) -> Self {
        self.outbound_buffer = frames;
        self
    }

    pub fn with_inbound_buffer(mut self, frames: usize) -> Self {
        self.inbound_buffer = frames;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

/// A `tcp://host:port` endpoint. `*` as host means every interface and is
/// only valid for binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn parse(spec: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(spec.to_string());

        let rest = spec.strip_prefix(SCHEME).ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_wildcard(&self) -> bool {
        self.host == ANY_HOST
    }

    /// Same host, different port. Used to turn a `:0` bind into the
    /// address peers should dial.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }

    async fn resolve(&self, for_bind: bool) -> Result<SocketAddr, TransportError> {
        let host = match (self.is_wildcard(), for_bind) {
            (true, true) => "0.0.0.0",
            (true, false) => return Err(TransportError::InvalidEndpoint(self.to_string())),
            (false, _) => self.host.as_str(),
        };

        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((host.trim_matches(|c| c == '[' || c == ']'), self.port))
                .await
                .map_err(|_| TransportError::InvalidEndpoint(self.to_string()))?
                .collect();

        // `*` binds IPv4 only, so `localhost` must not resolve to ::1 first
        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| TransportError::InvalidEndpoint(self.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Cloneable sending half. Frames are enqueued whole or not at all.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
    max_frame_length: usize,
    _guard: Arc<DropGuard>,
}

impl FrameSender {
    /// Frames the codec would refuse are rejected here, before they can
    /// reach the writer task and end the session.
    pub async fn send(&self, frame: Frame, wait: Duration) -> Result<(), TransportError> {
        let len = frame.encoded_len();
        if len > self.max_frame_length {
            return Err(WireError::FrameTooLong {
                len,
                max: self.max_frame_length,
            }
            .into());
        }

        match self.tx.send_timeout(frame, wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(TransportError::TimeoutError(wait)),
            Err(SendTimeoutError::Closed(_)) => Err(TransportError::ConnectionClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct FrameReceiver {
    rx: mpsc::Receiver<Frame>,
    _guard: Arc<DropGuard>,
}

impl FrameReceiver {
    pub async fn receive(&mut self, wait: Duration) -> Result<Frame, TransportError> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::TimeoutError(wait)),
        }
    }

    /// Next frame, or `None` once the peer is gone.
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

fn channel_pair(
    config: &TransportConfig,
    token: &CancellationToken,
) -> (
    FrameSender,
    mpsc::Receiver<Frame>,
    mpsc::Sender<Frame>,
    FrameReceiver,
) {
    let guard = Arc::new(token.clone().drop_guard());
    let (out_tx, out_rx) = mpsc::channel(config.outbound_buffer.max(1));
    let (in_tx, in_rx) = mpsc::channel(config.inbound_buffer.max(1));
    (
        FrameSender {
            tx: out_tx,
            max_frame_length: config.max_frame_length,
            _guard: guard.clone(),
        },
        out_rx,
        in_tx,
        FrameReceiver {
            rx: in_rx,
            _guard: guard,
        },
    )
}

/// An accepted (or directly dialed) TCP session with its own reader and
/// writer tasks.
pub struct Connection {
    peer: SocketAddr,
    sender: FrameSender,
    receiver: FrameReceiver,
}

impl Connection {
    pub(crate) fn spawn(stream: TcpStream, peer: SocketAddr, config: &TransportConfig) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {peer}: {err}");
        }

        let token = CancellationToken::new();
        let (sender, mut out_rx, in_tx, receiver) = channel_pair(config, &token);
        let (mut sink, mut source) =
            Framed::new(stream, FrameCodec::new(config.max_frame_length)).split();

        let writer_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(err) = sink.send(frame).await {
                                debug!("write to {peer} failed: {err}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            writer_token.cancel();
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    incoming = source.next() => match incoming {
                        Some(Ok(frame)) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            warn!("dropping connection from {peer}: {err}");
                            break;
                        }
                        None => break,
                    }
                }
            }
            token.cancel();
        });

        Self {
            peer,
            sender,
            receiver,
        }
    }

    pub async fn dial(endpoint: &Endpoint, config: &TransportConfig) -> Result<Self, TransportError> {
        let addr = endpoint.resolve(false).await?;
        let stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(TransportError::TimeoutError(config.connect_timeout)),
        };
        Ok(Self::spawn(stream, addr, config))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, frame: Frame, wait: Duration) -> Result<(), TransportError> {
        self.sender.send(frame, wait).await
    }

    pub async fn receive(&mut self, wait: Duration) -> Result<Frame, TransportError> {
        self.receiver.receive(wait).await
    }

    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

pub struct Listener {
    inner: TcpListener,
    endpoint: Endpoint,
    config: TransportConfig,
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint, config: TransportConfig) -> Result<Self, TransportError> {
        let addr = endpoint.resolve(true).await?;
        let inner = TcpListener::bind(addr).await.map_err(|err| match err.kind() {
            ErrorKind::AddrInUse => TransportError::AddressInUse(endpoint.to_string()),
            ErrorKind::AddrNotAvailable => TransportError::InvalidEndpoint(endpoint.to_string()),
            _ => TransportError::Io(err),
        })?;

        let local = inner.local_addr()?;
        info!("listening on {endpoint} ({local})");
        Ok(Self {
            inner,
            endpoint: endpoint.with_port(local.port()),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    /// The bound endpoint with the actual port filled in.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Endpoint a local peer can dial, with `*` replaced by loopback.
    pub fn dial_endpoint(&self) -> Endpoint {
        if self.endpoint.is_wildcard() {
            Endpoint::tcp("127.0.0.1", self.endpoint.port)
        } else {
            self.endpoint.clone()
        }
    }

    pub async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, peer) = self.inner.accept().await?;
        debug!("accepted {peer} on {}", self.endpoint);
        Ok(Connection::spawn(stream, peer, &self.config))
    }
}

/// Frames replayed at the start of every session of a [`Link`].
#[derive(Clone, Default)]
pub struct Greeting {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl Greeting {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: Arc::new(Mutex::new(frames)),
        }
    }

    pub fn push(&self, frame: Frame) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
    }

    pub fn retain(&self, keep: impl FnMut(&Frame) -> bool) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(keep);
    }

    fn snapshot(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Outbound connection with eventual-connection semantics.
///
/// `connect` returns before the peer is reachable; frames sent in the
/// meantime wait in the outbound buffer. After an established session drops
/// the supervisor redials up to `max_reconnect_attempts` times, then closes
/// the link so that `send` and `receive` report `ConnectionClosed`.
pub struct Link {
    endpoint: Endpoint,
    sender: FrameSender,
    receiver: FrameReceiver,
    greeting: Greeting,
    connected: watch::Receiver<bool>,
}

impl Link {
    pub fn connect(endpoint: &Endpoint, config: TransportConfig) -> Result<Self, TransportError> {
        Self::connect_with_greeting(endpoint, config, Greeting::default())
    }

    pub fn connect_with_greeting(
        endpoint: &Endpoint,
        config: TransportConfig,
        greeting: Greeting,
    ) -> Result<Self, TransportError> {
        if endpoint.is_wildcard() {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }

        let token = CancellationToken::new();
        let (sender, out_rx, in_tx, receiver) = channel_pair(&config, &token);
        let (state_tx, connected) = watch::channel(false);

        tokio::spawn(supervise(
            endpoint.clone(),
            config,
            out_rx,
            in_tx,
            greeting.clone(),
            state_tx,
            token,
        ));

        Ok(Self {
            endpoint: endpoint.clone(),
            sender,
            receiver,
            greeting,
            connected,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub async fn wait_connected(&self, wait: Duration) -> Result<(), TransportError> {
        let mut state = self.connected.clone();
        let up = timeout(wait, async { state.wait_for(|up| *up).await.map(|_| ()) }).await;
        match up {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::TimeoutError(wait)),
        }
    }

    pub async fn send(&self, frame: Frame, wait: Duration) -> Result<(), TransportError> {
        self.sender.send(frame, wait).await
    }

    pub async fn receive(&mut self, wait: Duration) -> Result<Frame, TransportError> {
        self.receiver.receive(wait).await
    }

    /// Next inbound frame, or `None` once the link has given up.
    pub async fn next(&mut self) -> Option<Frame> {
        self.receiver.next().await
    }

    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

async fn supervise(
    endpoint: Endpoint,
    config: TransportConfig,
    mut out_rx: mpsc::Receiver<Frame>,
    in_tx: mpsc::Sender<Frame>,
    greeting: Greeting,
    state_tx: watch::Sender<bool>,
    token: CancellationToken,
) {
    run_sessions(&endpoint, &config, &mut out_rx, &in_tx, &greeting, &state_tx, &token).await;
    // every exit path leaves the link down, before receivers see the close
    let _ = state_tx.send(false);
    drop((out_rx, in_tx));
}

async fn run_sessions(
    endpoint: &Endpoint,
    config: &TransportConfig,
    out_rx: &mut mpsc::Receiver<Frame>,
    in_tx: &mpsc::Sender<Frame>,
    greeting: &Greeting,
    state_tx: &watch::Sender<bool>,
    token: &CancellationToken,
) {
    let mut established = false;
    let mut failures: u32 = 0;

    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => return,
            stream = dial_once(endpoint, config) => stream,
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                debug!("connect to {endpoint} failed: {err}");
                if established {
                    failures += 1;
                    if failures >= config.max_reconnect_attempts {
                        warn!("giving up on {endpoint} after {failures} reconnect attempts");
                        return;
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(config.reconnect_interval) => continue,
                }
            }
        };

        failures = 0;
        if established {
            info!("reconnected to {endpoint}");
        } else {
            debug!("connected to {endpoint}");
        }
        established = true;
        let _ = state_tx.send(true);

        let (mut sink, mut source) =
            Framed::new(stream, FrameCodec::new(config.max_frame_length)).split();

        let mut alive = true;
        for frame in greeting.snapshot() {
            if let Err(err) = sink.send(frame).await {
                debug!("greeting to {endpoint} failed: {err}");
                alive = false;
                break;
            }
        }

        while alive {
            tokio::select! {
                _ = token.cancelled() => return,
                frame = out_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = sink.send(frame).await {
                            debug!("write to {endpoint} failed: {err}");
                            alive = false;
                        }
                    }
                    None => return,
                },
                incoming = source.next() => match incoming {
                    Some(Ok(frame)) => {
                        if in_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("session with {endpoint} failed: {err}");
                        alive = false;
                    }
                    None => alive = false,
                },
            }
        }

        let _ = state_tx.send(false);
        info!("session with {endpoint} closed, reconnecting");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(config.reconnect_interval) => {}
        }
    }
}

async fn dial_once(endpoint: &Endpoint, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let addr = endpoint.resolve(false).await?;
    let stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(TransportError::TimeoutError(config.connect_timeout)),
    };
    if let Err(err) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {addr}: {err}");
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn loopback() -> Endpoint {
        Endpoint::parse("tcp://127.0.0.1:0").unwrap()
    }

    fn fast_config() -> TransportConfig {
        TransportConfig::default()
            .with_reconnect_interval(Duration::from_millis(20))
            .with_max_reconnect_attempts(3)
    }

    #[test]
    fn parses_endpoint_specs() {
        let any = Endpoint::parse("tcp://*:5555").unwrap();
        assert!(any.is_wildcard());
        assert_eq!(any.port(), 5555);
        assert_eq!(any.to_string(), "tcp://*:5555");

        let local: Endpoint = "tcp://localhost:5560".parse().unwrap();
        assert_eq!(local.host(), "localhost");
        assert_eq!(local.port(), 5560);
    }

    #[test]
    fn rejects_malformed_endpoints() {
        for spec in [
            "localhost:5555",
            "udp://*:5555",
            "tcp://*",
            "tcp://:5555",
            "tcp://*:port",
            "tcp://*:70000",
            "tcp://host/path:1",
        ] {
            assert!(
                matches!(Endpoint::parse(spec), Err(TransportError::InvalidEndpoint(_))),
                "{spec} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn bind_twice_reports_address_in_use() {
        let first = Listener::bind(&loopback(), TransportConfig::default())
            .await
            .unwrap();
        let taken = first.endpoint().clone();

        let second = Listener::bind(&taken, TransportConfig::default()).await;
        assert!(matches!(second, Err(TransportError::AddressInUse(_))));
    }

    #[tokio::test]
    async fn link_cannot_dial_wildcard() {
        let result = Link::connect(&Endpoint::parse("tcp://*:5555").unwrap(), fast_config());
        assert!(matches!(result, Err(TransportError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn receive_times_out_without_traffic() {
        let listener = Listener::bind(&loopback(), fast_config()).await.unwrap();
        let mut link = Link::connect(&listener.dial_endpoint(), fast_config()).unwrap();
        let _server_side = listener.accept().await.unwrap();

        let wait = Duration::from_millis(50);
        let result = link.receive(wait).await;
        assert!(matches!(result, Err(TransportError::TimeoutError(d)) if d == wait));
    }

    #[tokio::test]
    async fn frames_sent_before_the_peer_exists_are_delivered() {
        // reserve a port, free it, and only start listening after sending
        let reserved = Listener::bind(&loopback(), fast_config()).await.unwrap();
        let endpoint = reserved.dial_endpoint();
        drop(reserved);

        let link = Link::connect(&endpoint, fast_config()).unwrap();
        link.send(Frame::request(1, Bytes::from_static(b"early")), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!link.is_connected());

        sleep(Duration::from_millis(50)).await;
        let listener = Listener::bind(&endpoint, fast_config()).await.unwrap();
        let mut conn = listener.accept().await.unwrap();

        let frame = conn.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(frame.id, 1);
        assert_eq!(&frame.payload[..], b"early");
    }

    #[tokio::test]
    async fn greeting_is_replayed_after_reconnect() {
        let listener = Listener::bind(&loopback(), fast_config()).await.unwrap();
        let greeting = Greeting::new(vec![Frame::ready()]);
        let link =
            Link::connect_with_greeting(&listener.dial_endpoint(), fast_config(), greeting).unwrap();

        let mut first = listener.accept().await.unwrap();
        let hello = first.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(hello.kind, crate::wire::MessageKind::Ready);
        drop(first);

        let mut second = listener.accept().await.unwrap();
        let hello = second.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(hello.kind, crate::wire::MessageKind::Ready);
        link.wait_connected(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn link_closes_after_reconnect_budget_is_spent() {
        let listener = Listener::bind(&loopback(), fast_config()).await.unwrap();
        let mut link = Link::connect(&listener.dial_endpoint(), fast_config()).unwrap();
        let conn = listener.accept().await.unwrap();
        link.wait_connected(Duration::from_secs(1)).await.unwrap();

        drop(conn);
        drop(listener);

        let result = link.receive(Duration::from_secs(3)).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        let result = link
            .send(Frame::ready(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert!(!link.is_connected());
        let result = link.wait_connected(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn send_times_out_when_buffer_stays_full() {
        let reserved = Listener::bind(&loopback(), fast_config()).await.unwrap();
        let endpoint = reserved.dial_endpoint();
        drop(reserved);

        let link = Link::connect(&endpoint, fast_config().with_outbound_buffer(1)).unwrap();
        link.send(Frame::ready(), Duration::from_millis(10)).await.unwrap();

        let wait = Duration::from_millis(30);
        let result = link.send(Frame::ready(), wait).await;
        assert!(matches!(result, Err(TransportError::TimeoutError(d)) if d == wait));
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_and_the_session_survives() {
        let config = fast_config().with_max_frame_length(1024);
        let listener = Listener::bind(&loopback(), config.clone()).await.unwrap();
        let link = Link::connect(&listener.dial_endpoint(), config).unwrap();
        let mut conn = listener.accept().await.unwrap();
        link.wait_connected(Duration::from_secs(1)).await.unwrap();

        let big = Frame::request(1, Bytes::from(vec![0u8; 4096]));
        let result = link.send(big, Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(TransportError::Wire(WireError::FrameTooLong { max: 1024, .. }))
        ));

        link.send(Frame::request(2, Bytes::from_static(b"small")), Duration::from_millis(100))
            .await
            .unwrap();
        let frame = conn.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.id, 2);
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn connected_flag_drops_when_the_inbound_side_is_gone() {
        let listener = Listener::bind(&loopback(), fast_config()).await.unwrap();
        let token = CancellationToken::new();
        let (_out_tx, out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let (state_tx, mut state_rx) = watch::channel(false);

        let task = tokio::spawn(supervise(
            listener.dial_endpoint(),
            fast_config(),
            out_rx,
            in_tx,
            Greeting::default(),
            state_tx,
            token,
        ));
        let conn = listener.accept().await.unwrap();
        timeout(Duration::from_secs(1), state_rx.wait_for(|up| *up))
            .await
            .unwrap()
            .unwrap();

        drop(in_rx);
        conn.send(Frame::ready(), Duration::from_millis(100)).await.unwrap();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(!*state_rx.borrow());
    }
}
