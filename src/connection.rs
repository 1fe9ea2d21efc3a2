//! A single TCP link to a remote peer
//!
//! # Link States
//!
//! ```text
//!   Open+Unapproved ──CONNECTION_ACCEPT / local accept──► Open+Approved
//!         │                                                    │
//!         └──── reject / DISCONNECT / socket error ──► Closed ◄┘
//! ```
//!
//! `Closed` is terminal. Chat is only written to, and only surfaced from,
//! approved links. Each link runs its own receive thread, which reads with a
//! short timeout so it notices a close from another thread.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::protocol::{self, Envelope, FrameBuffer, MessageKind};

// ============================================================================
// Constants
// ============================================================================

/// Receive buffer size per read
pub const READ_BUFFER_SIZE: usize = 4096;

/// Read timeout of the receive loop (how often it re-checks `connected`)
pub const READ_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Identity
// ============================================================================

/// Random identifier distinguishing links to the same host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Generate a random ID using CSPRNG
    pub fn generate() -> Self {
        use ring::rand::{SecureRandom, SystemRandom};
        let mut buf = [0u8; 8];
        if SystemRandom::new().fill(&mut buf).is_err() {
            // Uniqueness is all that matters here
            static FALLBACK: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
            return ConnectionId(FALLBACK.fetch_add(1, Ordering::Relaxed));
        }
        ConnectionId(u64::from_ne_bytes(buf))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Which side opened the TCP link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Opened by `connect_to_peer`
    Outbound,
}

// ============================================================================
// Link Owner Callbacks
// ============================================================================

/// Implemented by whoever owns the link (the registry)
pub trait ConnectionHandler: Send + Sync {
    /// A frame passed the link's own filtering (sender already overwritten)
    fn envelope_received(&self, conn: &Connection, envelope: Envelope);

    /// A frame was dropped: malformed, or chat on an unapproved link
    fn frame_dropped(&self, _conn: &Connection) {}

    /// The link reached `Closed`; fired exactly once per link
    fn connection_closed(&self, conn: &Connection);
}

// ============================================================================
// Connection
// ============================================================================

pub struct Connection {
    id: ConnectionId,
    host: IpAddr,
    port: u16,
    direction: Direction,
    /// Advisory `sender` stamped on outgoing envelopes
    local_sender: String,
    /// Write half; the receive thread reads from its own clone
    writer: Mutex<TcpStream>,
    connected: AtomicBool,
    approved: AtomicBool,
    handler: Arc<dyn ConnectionHandler>,
}

impl Connection {
    /// Wrap a connected stream in a new unapproved link
    ///
    /// The receive loop is not running until [`Connection::start`].
    pub fn new(
        stream: TcpStream,
        host: IpAddr,
        port: u16,
        direction: Direction,
        local_sender: impl Into<String>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> io::Result<Arc<Self>> {
        stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not set TCP_NODELAY for {}:{}: {}", host, port, e);
        }

        Ok(Arc::new(Self {
            id: ConnectionId::generate(),
            host,
            port,
            direction,
            local_sender: local_sender.into(),
            writer: Mutex::new(stream),
            connected: AtomicBool::new(true),
            approved: AtomicBool::new(false),
            handler,
        }))
    }

    /// Spawn the receive thread
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let reader = self.lock_writer().try_clone()?;
        let conn = Arc::clone(self);
        thread::Builder::new()
            .name(format!("conn-{}:{}", self.host, self.port))
            .spawn(move || conn.receive_loop(reader))?;
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_approved(&self) -> bool {
        self.approved.load(Ordering::SeqCst)
    }

    /// `host:port` for log lines
    pub fn peer_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send chat text; false unless the link is open and approved
    pub fn send(&self, content: &str) -> bool {
        if !self.is_connected() || !self.is_approved() {
            return false;
        }

        match self.write_envelope(&Envelope::chat(self.local_sender.as_str(), content)) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Error sending message to {}: {}", self.peer_address(), e);
                self.close();
                false
            }
        }
    }

    /// Send a handshake envelope regardless of approval
    pub fn send_control(&self, kind: MessageKind) -> io::Result<()> {
        let envelope = match kind {
            MessageKind::ConnectionRequest => Envelope::connection_request(self.local_sender.as_str()),
            MessageKind::ConnectionAccept => Envelope::connection_accept(self.local_sender.as_str()),
            MessageKind::ConnectionReject => Envelope::connection_reject(self.local_sender.as_str()),
            MessageKind::Disconnect => Envelope::disconnect(self.local_sender.as_str()),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' is not a link control message", other),
                ))
            }
        };
        self.write_envelope(&envelope)
    }

    /// Mark the link approved and send CONNECTION_ACCEPT
    ///
    /// The flag is set before the write so a chat sent in reply to the accept
    /// is never seen as unapproved. It is cleared again if the write fails.
    pub fn approve(&self) -> io::Result<()> {
        self.approved.store(true, Ordering::SeqCst);
        if let Err(e) = self.send_control(MessageKind::ConnectionAccept) {
            self.approved.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn write_envelope(&self, envelope: &Envelope) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link is closed"));
        }
        let frame =
            protocol::encode(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut writer = self.lock_writer();
        writer.write_all(&frame)?;
        writer.flush()
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, TcpStream> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Best-effort DISCONNECT, then close. No-op on a closed link.
    pub fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.send_control(MessageKind::Disconnect) {
            log::debug!("Could not send disconnect to {}: {}", self.peer_address(), e);
        }
        self.close();
    }

    /// Close the socket and notify the owner, exactly once
    fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.lock_writer().shutdown(Shutdown::Both);
        log::debug!("Link {} to {} closed", self.id, self.peer_address());
        self.handler.connection_closed(self);
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    fn receive_loop(self: Arc<Self>, mut reader: TcpStream) {
        let mut frames = FrameBuffer::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        while self.is_connected() {
            match reader.read(&mut buf) {
                Ok(0) => {
                    log::debug!("{} closed the connection", self.peer_address());
                    break;
                }
                Ok(n) => {
                    let overflows = frames.overflows();
                    for frame in frames.push(&buf[..n]) {
                        self.process_frame(&frame);
                        if !self.is_connected() {
                            break;
                        }
                    }
                    if frames.overflows() != overflows {
                        self.handler.frame_dropped(&self);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    if self.is_connected() {
                        log::debug!("Connection error with {}: {}", self.peer_address(), e);
                    }
                    break;
                }
            }
        }

        self.close();
    }

    fn process_frame(&self, frame: &[u8]) {
        let mut envelope = match protocol::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::debug!("Dropping frame from {}: {}", self.peer_address(), e);
                self.handler.frame_dropped(self);
                return;
            }
        };
        envelope.sender = self.host.to_string();

        match envelope.kind {
            MessageKind::Disconnect => {
                log::info!("Peer {} disconnected", self.peer_address());
                self.close();
            }
            MessageKind::ConnectionRequest => {
                log::info!("Connection request from {}", self.peer_address());
                self.handler.envelope_received(self, envelope);
            }
            MessageKind::ConnectionAccept => {
                log::info!("Connection accepted by {}", self.peer_address());
                self.approved.store(true, Ordering::SeqCst);
                self.handler.envelope_received(self, envelope);
            }
            MessageKind::ConnectionReject => {
                log::info!("Connection rejected by {}", self.peer_address());
                self.close();
                self.handler.envelope_received(self, envelope);
            }
            MessageKind::Chat => {
                if self.is_approved() {
                    self.handler.envelope_received(self, envelope);
                } else {
                    log::warn!("Ignored message from unapproved peer {}", self.peer_address());
                    self.handler.frame_dropped(self);
                }
            }
            MessageKind::Discovery | MessageKind::DiscoveryResponse => {
                log::debug!(
                    "Ignoring {} on TCP link from {}",
                    envelope.kind,
                    self.peer_address()
                );
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer_address())
            .field("direction", &self.direction)
            .field("connected", &self.is_connected())
            .field("approved", &self.is_approved())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
