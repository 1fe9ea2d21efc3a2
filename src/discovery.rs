//! LAN peer discovery via UDP broadcast
//!
//! # Protocol Flow
//!
//! ```text
//! Announcer (ephemeral port)                 Listener (discovery port)
//!   │                                               │
//!   │── DISCOVERY "host:name:tcpPort" ─────────────►│  255.255.255.255 and
//!   │                                               │  the /24 broadcast
//!   │◄─────────── DISCOVERY_RESPONSE "name:tcpPort" │  unicast reply
//!   │                                               │
//! ```
//!
//! Both datagrams use the same [`Envelope`] encoding as TCP links. A bare
//! integer payload (`"5000"`) is accepted from older peers. Datagrams that do
//! not decode, or whose port field is not an integer, are dropped silently.
//!
//! Discovery is IPv4 only: IPv6 has no broadcast.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::events::{NoopEvents, PeerEvents};
use crate::metrics::Metrics;
use crate::protocol::{self, Envelope, MessageKind};
use crate::worker::Worker;

// ============================================================================
// Constants
// ============================================================================

/// Receive buffer for one discovery datagram
pub const DATAGRAM_BUFFER_SIZE: usize = 2048;

/// Read timeout while collecting responses
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often the listener re-checks its stop flag
pub const LISTEN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long `stop_listening` waits for the listener thread
pub const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Broadcast address of the loopback network
const LOOPBACK_BROADCAST: Ipv4Addr = Ipv4Addr::new(127, 255, 255, 255);

/// mio token for the discovery socket
const SOCKET_TOKEN: Token = Token(0);

/// mio token for the shutdown waker
const WAKER_TOKEN: Token = Token(1);

// ============================================================================
// Discovered Peers
// ============================================================================

/// A peer that answered a discovery broadcast
///
/// Identity is `(host, port)`; the display name is informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub host: IpAddr,
    /// The peer's TCP listening port
    pub port: u16,
    pub display_name: String,
}

impl std::fmt::Display for DiscoveredPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.display_name.is_empty() {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{} ({}:{})", self.display_name, self.host, self.port)
        }
    }
}

// ============================================================================
// Payload Formats
// ============================================================================

/// Parsed DISCOVERY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Host the announcer believes it has (absent in legacy payloads)
    pub host: Option<String>,
    pub display_name: String,
    pub tcp_port: u16,
}

pub fn format_discovery_payload(host: IpAddr, display_name: &str, tcp_port: u16) -> String {
    format!("{}:{}:{}", host, display_name, tcp_port)
}

/// Parse `host:name:port`, legacy `TAG:port`, or a bare port
pub fn parse_discovery_payload(payload: &str) -> Option<Announcement> {
    let Some((rest, port)) = payload.rsplit_once(':') else {
        return Some(Announcement {
            host: None,
            display_name: String::new(),
            tcp_port: payload.trim().parse().ok()?,
        });
    };

    let tcp_port = port.trim().parse().ok()?;
    let (host, display_name) = match rest.split_once(':') {
        Some((host, name)) => (Some(host.to_string()), name.to_string()),
        None => (None, String::new()),
    };

    Some(Announcement {
        host,
        display_name,
        tcp_port,
    })
}

pub fn format_response_payload(display_name: &str, tcp_port: u16) -> String {
    format!("{}:{}", display_name, tcp_port)
}

/// Parse `name:port` or a bare port into `(name, port)`
pub fn parse_response_payload(payload: &str) -> Option<(String, u16)> {
    match payload.rsplit_once(':') {
        Some((name, port)) => Some((name.to_string(), port.trim().parse().ok()?)),
        None => Some((String::new(), payload.trim().parse().ok()?)),
    }
}

/// Where announcements are sent: the limited broadcast address and the
/// local /24 broadcast
///
/// A loopback host uses the 127/8 broadcast address, which reaches every
/// listener sharing the port on this machine.
pub fn broadcast_targets(local_host: IpAddr) -> Vec<Ipv4Addr> {
    let IpAddr::V4(v4) = local_host else {
        return Vec::new();
    };

    let directed = if v4.is_loopback() {
        LOOPBACK_BROADCAST
    } else {
        let [a, b, c, _] = v4.octets();
        Ipv4Addr::new(a, b, c, 255)
    };

    let mut targets = vec![Ipv4Addr::BROADCAST];
    if directed != Ipv4Addr::BROADCAST {
        targets.push(directed);
    }
    targets
}

// ============================================================================
// Shared State
// ============================================================================

/// State reachable from the listener thread
struct Inner {
    local_host: IpAddr,
    discovery_port: u16,
    tcp_port: AtomicU16,
    display_name: String,
    discovered: Mutex<HashMap<(IpAddr, u16), DiscoveredPeer>>,
    events: RwLock<Arc<dyn PeerEvents>>,
    metrics: Arc<Metrics>,
}

impl Inner {
    fn discovered(&self) -> MutexGuard<'_, HashMap<(IpAddr, u16), DiscoveredPeer>> {
        self.discovered.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tcp_port(&self) -> u16 {
        self.tcp_port.load(Ordering::SeqCst)
    }

    fn is_self(&self, host: IpAddr, tcp_port: u16) -> bool {
        host == self.local_host && tcp_port == self.tcp_port()
    }

    /// Reply a listener should send for an incoming datagram, if any
    fn response_for(&self, data: &[u8], from: SocketAddr) -> Option<Envelope> {
        let msg = match protocol::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Ignoring datagram from {}: {}", from, e);
                return None;
            }
        };
        if msg.kind != MessageKind::Discovery {
            return None;
        }

        let Some(announcement) = parse_discovery_payload(&msg.payload) else {
            log::debug!("Unparseable discovery payload from {}", from);
            return None;
        };
        if self.is_self(from.ip(), announcement.tcp_port) {
            return None;
        }

        log::debug!(
            "Responding to discovery from {} ({})",
            from,
            announcement.display_name
        );
        Some(Envelope::new(
            MessageKind::DiscoveryResponse,
            self.local_host.to_string(),
            format_response_payload(&self.display_name, self.tcp_port()),
        ))
    }

    /// Record a DISCOVERY_RESPONSE; returns the peer if it is new this round
    fn handle_response(&self, data: &[u8], from: SocketAddr) -> Option<DiscoveredPeer> {
        let msg = match protocol::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Could not parse discovery response from {}: {}", from, e);
                return None;
            }
        };
        if msg.kind != MessageKind::DiscoveryResponse {
            return None;
        }

        let (display_name, port) = parse_response_payload(&msg.payload)?;
        let host = from.ip();
        if self.is_self(host, port) {
            return None;
        }

        let peer = DiscoveredPeer {
            host,
            port,
            display_name,
        };
        {
            let mut discovered = self.discovered();
            if discovered.contains_key(&(host, port)) {
                return None;
            }
            discovered.insert((host, port), peer.clone());
        }

        log::info!("Discovered peer: {}", peer);
        Metrics::incr(&self.metrics.peers_discovered_total);
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peer_discovered(&peer);
        Some(peer)
    }

    fn broadcast_and_collect(&self, timeout: Duration) -> io::Result<()> {
        let socket = UdpSocket::bind((self.local_host, 0))?;
        socket.set_broadcast(true)?;

        let announcement = Envelope::new(
            MessageKind::Discovery,
            self.local_host.to_string(),
            format_discovery_payload(self.local_host, &self.display_name, self.tcp_port()),
        );
        let frame = protocol::encode(&announcement)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut sent = 0;
        for target in broadcast_targets(self.local_host) {
            match socket.send_to(&frame, (target, self.discovery_port)) {
                Ok(_) => sent += 1,
                Err(e) => log::debug!("Could not announce to {}: {}", target, e),
            }
        }
        if sent == 0 {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no broadcast target reachable",
            ));
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(remaining.min(RESPONSE_POLL_INTERVAL)))?;

            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    self.handle_response(&buf[..n], from);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => log::error!("Error receiving discovery response: {}", e),
            }
        }

        Ok(())
    }
}

// ============================================================================
// Listener
// ============================================================================

struct ListenerLoop {
    worker: Worker,
    waker: Waker,
    local_addr: SocketAddr,
}

/// UDP socket that can share its port with other peers on the same machine
fn bind_reusable_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Bind the discovery port
///
/// On unix a socket bound to a unicast address never receives broadcasts, so
/// the listener always takes the wildcard address. Elsewhere the local
/// address is tried first, then the wildcard.
fn bind_discovery_socket(local_host: IpAddr, port: u16) -> io::Result<UdpSocket> {
    let wildcard = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    if cfg!(unix) {
        return bind_reusable_udp(wildcard);
    }

    match bind_reusable_udp(SocketAddr::new(local_host, port)) {
        Ok(socket) => Ok(socket),
        Err(e) => {
            log::debug!(
                "Could not bind discovery to {}:{} ({}), trying all interfaces",
                local_host,
                port,
                e
            );
            bind_reusable_udp(wildcard)
        }
    }
}

fn listen_loop(
    inner: Arc<Inner>,
    mut poll: Poll,
    socket: mio::net::UdpSocket,
    running: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(64);
    let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];

    while running.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, Some(LISTEN_POLL_INTERVAL)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("Discovery listener poll failed: {}", e);
            break;
        }

        for event in events.iter() {
            if event.token() == SOCKET_TOKEN {
                drain_requests(&inner, &socket, &mut buf);
            }
        }
    }

    log::debug!("Discovery listener exited");
}

fn drain_requests(inner: &Inner, socket: &mio::net::UdpSocket, buf: &mut [u8]) {
    loop {
        let (len, from) = match socket.recv_from(buf) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("Error in discovery listener: {}", e);
                break;
            }
        };

        let Some(response) = inner.response_for(&buf[..len], from) else {
            continue;
        };
        let sent = protocol::encode(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .and_then(|frame| socket.send_to(&frame, from));
        if let Err(e) = sent {
            log::debug!("Could not answer discovery from {}: {}", from, e);
        }
    }
}

// ============================================================================
// Discovery Service
// ============================================================================

pub struct DiscoveryService {
    inner: Arc<Inner>,
    listener: Mutex<Option<ListenerLoop>>,
}

impl DiscoveryService {
    /// Service announcing `display_name` reachable at `local_host:tcp_port`
    pub fn new(local_host: IpAddr, discovery_port: u16, tcp_port: u16, display_name: &str) -> Self {
        Self::with_metrics(
            local_host,
            discovery_port,
            tcp_port,
            display_name,
            Arc::new(Metrics::new()),
        )
    }

    pub fn with_metrics(
        local_host: IpAddr,
        discovery_port: u16,
        tcp_port: u16,
        display_name: &str,
        metrics: Arc<Metrics>,
    ) -> Self {
        DiscoveryService {
            inner: Arc::new(Inner {
                local_host,
                discovery_port,
                tcp_port: AtomicU16::new(tcp_port),
                display_name: display_name.to_string(),
                discovered: Mutex::new(HashMap::new()),
                events: RwLock::new(Arc::new(NoopEvents)),
                metrics,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Install the observer notified of newly discovered peers
    pub fn set_events(&self, events: Arc<dyn PeerEvents>) {
        *self.inner.events.write().unwrap_or_else(|e| e.into_inner()) = events;
    }

    /// Change the advertised TCP port (after binding an ephemeral port)
    pub fn set_tcp_port(&self, tcp_port: u16) {
        self.inner.tcp_port.store(tcp_port, Ordering::SeqCst);
    }

    pub fn tcp_port(&self) -> u16 {
        self.inner.tcp_port()
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    fn listener_state(&self) -> MutexGuard<'_, Option<ListenerLoop>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Announcing
    // ------------------------------------------------------------------------

    /// Broadcast a DISCOVERY and collect responses for `timeout`
    ///
    /// Blocks the calling thread for the whole window. Returns every peer
    /// discovered since the last [`DiscoveryService::clear_discovered`].
    pub fn announce(&self, timeout: Duration) -> Vec<DiscoveredPeer> {
        log::info!("Broadcasting discovery message...");

        if let Err(e) = self.inner.broadcast_and_collect(timeout) {
            log::error!("Error broadcasting discovery: {}", e);
        }

        let peers = self.discovered_peers();
        log::info!("Discovery complete. Found {} peers.", peers.len());
        peers
    }

    /// Snapshot of discovered peers, ordered by address
    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<_> = self.inner.discovered().values().cloned().collect();
        peers.sort_by_key(|p| (p.host, p.port));
        peers
    }

    /// Forget discovered peers before a new scan round
    pub fn clear_discovered(&self) {
        self.inner.discovered().clear();
    }

    // ------------------------------------------------------------------------
    // Listening
    // ------------------------------------------------------------------------

    /// Start answering discovery broadcasts; false if the port cannot be bound
    pub fn start_listening(&self) -> bool {
        let mut listener = self.listener_state();
        if listener.as_ref().is_some_and(|l| l.worker.is_running()) {
            log::warn!("Already listening for discovery broadcasts");
            return true;
        }

        match self.spawn_listener() {
            Ok(state) => {
                log::info!("Listening for discovery broadcasts on {}", state.local_addr);
                *listener = Some(state);
                true
            }
            Err(e) => {
                log::error!(
                    "Could not bind to discovery port {}: {}",
                    self.inner.discovery_port,
                    e
                );
                false
            }
        }
    }

    fn spawn_listener(&self) -> io::Result<ListenerLoop> {
        let std_socket = bind_discovery_socket(self.inner.local_host, self.inner.discovery_port)?;
        let local_addr = std_socket.local_addr()?;
        let mut socket = mio::net::UdpSocket::from_std(std_socket);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let inner = Arc::clone(&self.inner);
        let worker = Worker::spawn("discovery-listen", move |running| {
            listen_loop(inner, poll, socket, running)
        })?;

        Ok(ListenerLoop {
            worker,
            waker,
            local_addr,
        })
    }

    /// Stop answering broadcasts, waiting at most [`LISTENER_STOP_TIMEOUT`]
    pub fn stop_listening(&self) {
        let Some(state) = self.listener_state().take() else {
            return;
        };

        state.worker.request_stop();
        if let Err(e) = state.waker.wake() {
            log::debug!("Could not wake discovery listener: {}", e);
        }
        state.worker.stop(LISTENER_STOP_TIMEOUT);
        log::info!("Stopped listening for discovery broadcasts");
    }

    pub fn is_listening(&self) -> bool {
        self.listener_state()
            .as_ref()
            .is_some_and(|l| l.worker.is_running())
    }

    /// Address the listener is bound to, while listening
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener_state().as_ref().map(|l| l.local_addr)
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

// ============================================================================
// Tests
// ============================================================================
