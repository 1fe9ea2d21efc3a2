//! Connection registry: TCP listener, link table and handshake policy
//!
//! The registry owns every [`Connection`], keyed by remote host. A host may
//! have several links at once (different ports, or an inbound and an outbound
//! link to the same machine), so each host maps to a list.
//!
//! # Handshake
//!
//! ```text
//! Initiator                                         Acceptor
//!   │── TCP connect ──────────────────────────────────►│  (both Unapproved)
//!   │── CONNECTION_REQUEST ───────────────────────────►│  surfaced as pending
//!   │                                                  │  accept_connection()
//!   │◄─ CONNECTION_ACCEPT ─────────────────────────────│  Approved
//!   │   Approved                                       │
//!   │◄════════════════════ chat ══════════════════════►│
//! ```
//!
//! `reject_connection()` answers CONNECTION_REJECT and tears down every link
//! to that host, approved or not.
//!
//! The link table is only touched under its mutex, and no socket I/O or
//! observer callback runs while it is held.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::connection::{Connection, ConnectionHandler, ConnectionId, Direction};
use crate::events::{NoopEvents, PeerEvents};
use crate::metrics::Metrics;
use crate::protocol::{Envelope, MessageKind};
use crate::worker::Worker;

// ============================================================================
// Constants
// ============================================================================

/// Pending-connection backlog of the listening socket
pub const LISTEN_BACKLOG: i32 = 5;

/// Timeout for outbound TCP connects
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the accept loop re-checks its stop flag
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long `stop_server` waits for the accept thread
pub const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// mio token for the shutdown waker
const WAKER_TOKEN: Token = Token(1);

// ============================================================================
// Snapshot Types
// ============================================================================

/// Read-only view of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub host: IpAddr,
    pub port: u16,
    pub direction: Direction,
    pub approved: bool,
}

impl ConnectionInfo {
    fn of(conn: &Connection) -> Self {
        Self {
            id: conn.id(),
            host: conn.host(),
            port: conn.port(),
            direction: conn.direction(),
            approved: conn.is_approved(),
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

type LinkTable = HashMap<IpAddr, Vec<Arc<Connection>>>;

/// State reachable from the accept thread and every receive thread
struct Shared {
    local_host: IpAddr,
    links: Mutex<LinkTable>,
    events: RwLock<Arc<dyn PeerEvents>>,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn links(&self) -> MutexGuard<'_, LinkTable> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn events(&self) -> Arc<dyn PeerEvents> {
        Arc::clone(&self.events.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Wrap a connected stream, add it to the table and start its receive loop
    fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        host: IpAddr,
        port: u16,
        direction: Direction,
    ) -> io::Result<Arc<Connection>> {
        let handler: Arc<dyn ConnectionHandler> = Arc::clone(self) as Arc<dyn ConnectionHandler>;
        let conn = Connection::new(
            stream,
            host,
            port,
            direction,
            self.local_host.to_string(),
            handler,
        )?;

        self.links().entry(host).or_default().push(Arc::clone(&conn));
        Metrics::incr(&self.metrics.connections_opened_total);

        if let Err(e) = conn.start() {
            conn.disconnect();
            return Err(e);
        }

        self.events().peer_connected(host);
        Ok(conn)
    }

    fn host_links(&self, host: IpAddr) -> Vec<Arc<Connection>> {
        self.links().get(&host).cloned().unwrap_or_default()
    }

    fn all_links(&self) -> Vec<Arc<Connection>> {
        self.links().values().flatten().cloned().collect()
    }

    fn find(&self, host: IpAddr, port: u16) -> Option<Arc<Connection>> {
        self.links()
            .get(&host)
            .and_then(|list| list.iter().find(|c| c.port() == port).cloned())
    }
}

impl ConnectionHandler for Shared {
    fn envelope_received(&self, conn: &Connection, envelope: Envelope) {
        match envelope.kind {
            MessageKind::Chat => Metrics::incr(&self.metrics.chat_received_total),
            MessageKind::ConnectionAccept => Metrics::incr(&self.metrics.handshakes_accepted_total),
            MessageKind::ConnectionReject => Metrics::incr(&self.metrics.handshakes_rejected_total),
            _ => {}
        }
        self.events()
            .message_received(conn.host(), conn.port(), &envelope);
    }

    fn frame_dropped(&self, _conn: &Connection) {
        Metrics::incr(&self.metrics.frames_dropped_total);
    }

    fn connection_closed(&self, conn: &Connection) {
        {
            let mut links = self.links();
            if let Some(list) = links.get_mut(&conn.host()) {
                list.retain(|c| c.id() != conn.id());
                if list.is_empty() {
                    links.remove(&conn.host());
                }
            }
        }
        Metrics::incr(&self.metrics.connections_closed_total);

        if conn.is_approved() {
            log::info!("Peer {} disconnected", conn.peer_address());
            self.events().peer_disconnected(conn.host(), conn.port());
        }
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

struct AcceptLoop {
    worker: Worker,
    waker: Waker,
    local_addr: SocketAddr,
}

/// Listening socket with SO_REUSEADDR and an explicit backlog
fn bind_listener(port: u16) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Polls a clone of `listener` for readiness; accepts on the std socket so
/// accepted streams come out as plain blocking `TcpStream`s
fn accept_loop(
    shared: Arc<Shared>,
    mut poll: Poll,
    listener: std::net::TcpListener,
    running: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(64);

    while running.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, Some(ACCEPT_POLL_INTERVAL)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("Accept loop poll failed: {}", e);
            break;
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_pending(&shared, &listener, &running);
            }
        }
    }

    log::debug!("Accept loop exited");
}

fn accept_pending(shared: &Arc<Shared>, listener: &std::net::TcpListener, running: &AtomicBool) {
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    log::error!("Error accepting connection: {}", e);
                }
                break;
            }
        };

        log::info!("Incoming connection from {}", addr);
        let registered = stream
            .set_nonblocking(false)
            .and_then(|()| shared.register(stream, addr.ip(), addr.port(), Direction::Inbound));
        if let Err(e) = registered {
            log::error!("Could not register connection from {}: {}", addr, e);
        }
    }
}

// ============================================================================
// Connection Registry
// ============================================================================

pub struct ConnectionRegistry {
    shared: Arc<Shared>,
    port: u16,
    accept: Mutex<Option<AcceptLoop>>,
}

impl ConnectionRegistry {
    /// Registry advertising `local_host` and listening on `port` once started
    pub fn new(local_host: IpAddr, port: u16) -> Self {
        Self::with_metrics(local_host, port, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(local_host: IpAddr, port: u16, metrics: Arc<Metrics>) -> Self {
        ConnectionRegistry {
            shared: Arc::new(Shared {
                local_host,
                links: Mutex::new(HashMap::new()),
                events: RwLock::new(Arc::new(NoopEvents)),
                metrics,
            }),
            port,
            accept: Mutex::new(None),
        }
    }

    /// Install the observer for message, connect and disconnect events
    pub fn set_events(&self, events: Arc<dyn PeerEvents>) {
        *self.shared.events.write().unwrap_or_else(|e| e.into_inner()) = events;
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.shared.metrics)
    }

    fn accept_state(&self) -> MutexGuard<'_, Option<AcceptLoop>> {
        self.accept.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Server
    // ------------------------------------------------------------------------

    /// Bind the listener and start accepting; false if the port is unavailable
    pub fn start_server(&self) -> bool {
        let mut accept = self.accept_state();
        if accept.as_ref().is_some_and(|a| a.worker.is_running()) {
            log::warn!("TCP server already running");
            return true;
        }

        match self.spawn_accept_loop() {
            Ok(state) => {
                log::info!("TCP server started on {}", state.local_addr);
                *accept = Some(state);
                true
            }
            Err(e) => {
                log::error!("Could not start TCP server on port {}: {}", self.port, e);
                false
            }
        }
    }

    fn spawn_accept_loop(&self) -> io::Result<AcceptLoop> {
        let listener = bind_listener(self.port)?;
        let local_addr = listener.local_addr()?;
        let mut readiness = TcpListener::from_std(listener.try_clone()?);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut readiness, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::clone(&self.shared);
        let worker = Worker::spawn("tcp-accept", move |running| {
            // Keeps the readiness registration alive for the loop's lifetime
            let _readiness = readiness;
            accept_loop(shared, poll, listener, running)
        })?;

        Ok(AcceptLoop {
            worker,
            waker,
            local_addr,
        })
    }

    /// Stop accepting and disconnect every link
    ///
    /// Waits at most [`SERVER_STOP_TIMEOUT`] for the accept thread.
    pub fn stop_server(&self) {
        let accept = self.accept_state().take();
        if let Some(state) = &accept {
            state.worker.request_stop();
            if let Err(e) = state.waker.wake() {
                log::debug!("Could not wake accept loop: {}", e);
            }
        }

        for host in self.connected_peers() {
            self.disconnect_peer(host);
        }

        if let Some(state) = accept {
            state.worker.stop(SERVER_STOP_TIMEOUT);
            log::info!("TCP server stopped");
        }
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.accept_state().as_ref().map(|a| a.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.accept_state()
            .as_ref()
            .is_some_and(|a| a.worker.is_running())
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    /// Open an outbound link; true if one to `host:port` already exists
    pub fn connect_to_peer(&self, host: IpAddr, port: u16) -> bool {
        if self.shared.find(host, port).is_some() {
            log::warn!("Already connected to {}:{}", host, port);
            return true;
        }

        let addr = SocketAddr::new(host, port);
        let stream = match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Could not connect to {}: {}", addr, e);
                return false;
            }
        };

        match self.shared.register(stream, host, port, Direction::Outbound) {
            Ok(_) => {
                log::info!("Connected to peer {}", addr);
                true
            }
            Err(e) => {
                log::error!("Could not set up link to {}: {}", addr, e);
                false
            }
        }
    }

    /// Ask the remote user of the `host:port` link for approval
    pub fn request_connection(&self, host: IpAddr, port: u16) -> bool {
        let Some(conn) = self.shared.find(host, port) else {
            log::warn!("No link to {}:{} to request approval on", host, port);
            return false;
        };

        match conn.send_control(MessageKind::ConnectionRequest) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Could not send connection request to {}: {}", conn.peer_address(), e);
                conn.disconnect();
                false
            }
        }
    }

    /// Approve the first pending link from `host`
    ///
    /// True as well when nothing is pending but the host already has an
    /// approved link. Links are taken in registration order and the request
    /// that prompted the accept is not matched, so an earlier outbound link
    /// we never requested on is approved ahead of the inbound requester.
    pub fn accept_connection(&self, host: IpAddr) -> bool {
        let links = self.shared.host_links(host);
        let pending = links
            .iter()
            .find(|c| c.is_connected() && !c.is_approved())
            .cloned();

        let Some(conn) = pending else {
            return links.iter().any(|c| c.is_approved());
        };

        match conn.approve() {
            Ok(()) => {
                Metrics::incr(&self.shared.metrics.handshakes_accepted_total);
                log::info!("Accepted connection from {}", conn.peer_address());
                true
            }
            Err(e) => {
                log::error!("Error accepting connection from {}: {}", conn.peer_address(), e);
                conn.disconnect();
                false
            }
        }
    }

    /// Refuse every pending link from `host`, then drop all of its links
    pub fn reject_connection(&self, host: IpAddr) {
        let links = self.shared.host_links(host);
        if links.is_empty() {
            return;
        }

        for conn in links.iter().filter(|c| !c.is_approved()) {
            if let Err(e) = conn.send_control(MessageKind::ConnectionReject) {
                log::debug!("Could not send reject to {}: {}", conn.peer_address(), e);
            }
            Metrics::incr(&self.shared.metrics.handshakes_rejected_total);
        }
        log::info!("Rejected connection from {}", host);

        self.disconnect_peer(host);
    }

    /// Disconnect and forget every link to `host`; false if there were none
    pub fn disconnect_peer(&self, host: IpAddr) -> bool {
        let Some(links) = self.shared.links().remove(&host) else {
            return false;
        };

        for conn in links {
            conn.disconnect();
        }
        true
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Send on every approved link to `host`; true if any accepted it
    pub fn send_to_peer(&self, host: IpAddr, content: &str) -> bool {
        let mut sent = false;
        for conn in self.shared.host_links(host) {
            if conn.send(content) {
                Metrics::incr(&self.shared.metrics.chat_sent_total);
                sent = true;
            }
        }
        sent
    }

    /// Send on every approved link; returns the number of deliveries
    pub fn broadcast_message(&self, content: &str) -> usize {
        let mut count = 0;
        for conn in self.shared.all_links() {
            if conn.send(content) {
                Metrics::incr(&self.shared.metrics.chat_sent_total);
                count += 1;
            }
        }
        count
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Hosts with at least one link
    pub fn connected_peers(&self) -> Vec<IpAddr> {
        self.shared.links().keys().copied().collect()
    }

    pub fn is_peer_approved(&self, host: IpAddr) -> bool {
        self.shared
            .links()
            .get(&host)
            .is_some_and(|list| list.iter().any(|c| c.is_approved()))
    }

    /// Snapshot of every link
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .all_links()
            .iter()
            .map(|c| ConnectionInfo::of(c))
            .collect()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.stop_server();
    }
}

// ============================================================================
// Tests
// ============================================================================
