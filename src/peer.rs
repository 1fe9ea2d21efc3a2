//! Orchestrator: one chat peer on the LAN
//!
//! Owns a [`ConnectionRegistry`] and a [`DiscoveryService`] sharing one
//! [`Metrics`] instance, and turns their low-level outcomes into
//! [`StatusEvent`]s for the front end. It also remembers which hosts have
//! asked for approval and not been answered yet.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{ConfigError, PeerConfig};
use crate::discovery::{DiscoveredPeer, DiscoveryService};
use crate::events::{PeerEvents, StatusEvent};
use crate::metrics::Metrics;
use crate::protocol::{Envelope, MessageKind};
use crate::registry::{ConnectionInfo, ConnectionRegistry};

/// Default window for a discovery round
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Pending Request Tracking
// ============================================================================

/// Observer installed on the registry and discovery service
///
/// Keeps the pending-request set current, then forwards to the user's
/// observer.
struct Tracker {
    pending: Mutex<HashSet<IpAddr>>,
    events: Arc<dyn PeerEvents>,
}

impl Tracker {
    fn pending(&self) -> MutexGuard<'_, HashSet<IpAddr>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(&self, event: StatusEvent) {
        self.events.status(&event);
    }
}

impl PeerEvents for Tracker {
    fn message_received(&self, host: IpAddr, port: u16, envelope: &Envelope) {
        match envelope.kind {
            MessageKind::ConnectionRequest => {
                log::info!("Connection request from {}:{}", host, port);
                self.pending().insert(host);
            }
            MessageKind::ConnectionAccept => {
                self.pending().remove(&host);
                self.report(StatusEvent::ApprovedByPeer { host });
            }
            MessageKind::ConnectionReject => {
                self.pending().remove(&host);
                self.report(StatusEvent::RejectedByPeer { host });
            }
            _ => {}
        }
        self.events.message_received(host, port, envelope);
    }

    fn peer_connected(&self, host: IpAddr) {
        self.events.peer_connected(host);
    }

    fn peer_disconnected(&self, host: IpAddr, port: u16) {
        self.pending().remove(&host);
        self.events.peer_disconnected(host, port);
    }

    fn peer_discovered(&self, peer: &DiscoveredPeer) {
        self.events.peer_discovered(peer);
    }

    fn status(&self, event: &StatusEvent) {
        self.events.status(event);
    }
}

// ============================================================================
// Chat Peer
// ============================================================================

pub struct ChatPeer {
    config: PeerConfig,
    registry: ConnectionRegistry,
    discovery: DiscoveryService,
    tracker: Arc<Tracker>,
    metrics: Arc<Metrics>,
}

impl ChatPeer {
    /// Build a stopped peer reporting to `events`
    pub fn new(config: PeerConfig, events: Arc<dyn PeerEvents>) -> Result<Self, PeerError> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let registry =
            ConnectionRegistry::with_metrics(config.local_host, config.tcp_port, Arc::clone(&metrics));
        let discovery = DiscoveryService::with_metrics(
            config.local_host,
            config.discovery_port,
            config.tcp_port,
            &config.display_name,
            Arc::clone(&metrics),
        );

        let tracker = Arc::new(Tracker {
            pending: Mutex::new(HashSet::new()),
            events,
        });
        registry.set_events(Arc::clone(&tracker) as Arc<dyn PeerEvents>);
        discovery.set_events(Arc::clone(&tracker) as Arc<dyn PeerEvents>);

        Ok(ChatPeer {
            config,
            registry,
            discovery,
            tracker,
            metrics,
        })
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start the TCP server, then the discovery listener
    ///
    /// A discovery port that cannot be bound is logged and tolerated: the
    /// peer still accepts direct connections.
    pub fn start(&self) -> Result<(), PeerError> {
        if !self.registry.start_server() {
            let port = self.config.tcp_port;
            self.tracker.report(StatusEvent::ServerStartFailed { port });
            return Err(PeerError::ServerStart { port });
        }

        if let Some(addr) = self.registry.local_addr() {
            self.discovery.set_tcp_port(addr.port());
        }

        if !self.discovery.start_listening() {
            log::warn!(
                "Discovery disabled: UDP port {} unavailable",
                self.config.discovery_port
            );
        }

        log::info!(
            "{} ready on {}:{}",
            self.config.display_name,
            self.config.local_host,
            self.discovery.tcp_port()
        );
        Ok(())
    }

    /// Stop the discovery listener and the server, dropping every link
    pub fn stop(&self) {
        self.discovery.stop_listening();
        self.registry.stop_server();
        self.tracker.pending().clear();
    }

    /// TCP listener address, while started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.registry.local_addr()
    }

    /// Discovery listener address, while listening
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.listen_addr()
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Connect to `host:port` and ask its user for approval
    pub fn connect(&self, host: IpAddr, port: u16) -> bool {
        if !self.registry.connect_to_peer(host, port) || !self.registry.request_connection(host, port)
        {
            self.tracker.report(StatusEvent::ConnectFailed { host, port });
            return false;
        }

        self.tracker
            .report(StatusEvent::AwaitingApproval { host, port });
        true
    }

    /// Approve the pending request from `host`
    pub fn accept(&self, host: IpAddr) -> bool {
        if self.registry.accept_connection(host) {
            self.tracker.pending().remove(&host);
            self.tracker.report(StatusEvent::Accepted { host });
            true
        } else {
            self.tracker.report(StatusEvent::AcceptFailed { host });
            false
        }
    }

    /// Refuse `host` and drop all of its links
    pub fn reject(&self, host: IpAddr) {
        self.registry.reject_connection(host);
        self.tracker.pending().remove(&host);
        self.tracker.report(StatusEvent::RejectedLocally { host });
    }

    pub fn disconnect(&self, host: IpAddr) -> bool {
        self.tracker.pending().remove(&host);
        self.registry.disconnect_peer(host)
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    pub fn send_to(&self, host: IpAddr, content: &str) -> bool {
        self.registry.send_to_peer(host, content)
    }

    /// Send to every approved link; reports when nobody received it
    pub fn broadcast(&self, content: &str) -> usize {
        let delivered = self.registry.broadcast_message(content);
        if delivered == 0 {
            self.tracker.report(StatusEvent::NoApprovedPeers);
        }
        delivered
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Run a fresh discovery round, blocking for `timeout`
    pub fn discover(&self, timeout: Duration) -> Vec<DiscoveredPeer> {
        self.discovery.clear_discovered();
        let peers = self.discovery.announce(timeout);
        self.tracker
            .report(StatusEvent::DiscoveryFinished { found: peers.len() });
        peers
    }

    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.discovery.discovered_peers()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn connected_peers(&self) -> Vec<IpAddr> {
        self.registry.connected_peers()
    }

    pub fn is_peer_approved(&self, host: IpAddr) -> bool {
        self.registry.is_peer_approved(host)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.connections()
    }

    /// Hosts that asked for approval and still hold an unapproved link
    pub fn pending_requests(&self) -> Vec<IpAddr> {
        let waiting: HashSet<IpAddr> = self
            .registry
            .connections()
            .into_iter()
            .filter(|c| !c.approved)
            .map(|c| c.host)
            .collect();

        let mut pending = self.tracker.pending();
        pending.retain(|host| waiting.contains(host));

        let mut hosts: Vec<_> = pending.iter().copied().collect();
        hosts.sort();
        hosts
    }
}

impl Drop for ChatPeer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Configuration rejected before startup
    Config(ConfigError),
    /// TCP listener could not bind
    ServerStart { port: u16 },
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::Config(e) => write!(f, "Invalid configuration: {}", e),
            PeerError::ServerStart { port } => {
                write!(f, "Could not start TCP server on port {}", port)
            }
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PeerError::Config(e) => Some(e),
            PeerError::ServerStart { .. } => None,
        }
    }
}

impl From<ConfigError> for PeerError {
    fn from(e: ConfigError) -> Self {
        PeerError::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use std::time::Instant;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const WAIT: Duration = Duration::from_secs(3);

    struct StatusLog(Mutex<Sender<StatusEvent>>);

    impl PeerEvents for StatusLog {
        fn status(&self, event: &StatusEvent) {
            let _ = self.0.lock().unwrap().send(event.clone());
        }
    }

    fn free_udp_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn peer(name: &str) -> (ChatPeer, Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel();
        let config = PeerConfig {
            local_host: LOCALHOST,
            tcp_port: 0,
            discovery_port: free_udp_port(),
            display_name: name.to_string(),
            debug: false,
        };
        let peer = ChatPeer::new(config, Arc::new(StatusLog(Mutex::new(tx)))).unwrap();
        peer.start().unwrap();
        (peer, rx)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn expect_status(rx: &Receiver<StatusEvent>, wanted: &StatusEvent) {
        let deadline = Instant::now() + WAIT;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(event) if &event == wanted => return,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        panic!("status {:?} not reported", wanted);
    }

    #[test]
    fn test_new_rejects_bad_display_name() {
        let config = PeerConfig {
            display_name: "has:colon".into(),
            ..PeerConfig::default()
        };
        let err = ChatPeer::new(config, Arc::new(crate::events::NoopEvents)).err();
        assert!(matches!(err, Some(PeerError::Config(_))));
    }

    #[test]
    fn test_start_advertises_bound_port() {
        let (alice, _rx) = peer("alice");
        let port = alice.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(alice.discovery.tcp_port(), port);
    }

    #[test]
    fn test_broadcast_without_peers_reports_status() {
        let (alice, rx) = peer("alice");
        assert_eq!(alice.broadcast("anyone?"), 0);
        expect_status(&rx, &StatusEvent::NoApprovedPeers);
    }

    #[test]
    fn test_connect_failure_reports_status() {
        let (alice, rx) = peer("alice");
        let closed = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        assert!(!alice.connect(LOCALHOST, closed));
        expect_status(&rx, &StatusEvent::ConnectFailed { host: LOCALHOST, port: closed });
    }

    #[test]
    fn test_request_accept_flow() {
        let (alice, alice_rx) = peer("alice");
        let (bob, bob_rx) = peer("bob");
        let bob_port = bob.local_addr().unwrap().port();

        assert!(alice.connect(LOCALHOST, bob_port));
        expect_status(&alice_rx, &StatusEvent::AwaitingApproval { host: LOCALHOST, port: bob_port });

        assert!(wait_for(|| bob.pending_requests() == vec![LOCALHOST]));
        assert!(bob.accept(LOCALHOST));
        expect_status(&bob_rx, &StatusEvent::Accepted { host: LOCALHOST });
        assert!(bob.pending_requests().is_empty());

        expect_status(&alice_rx, &StatusEvent::ApprovedByPeer { host: LOCALHOST });
        assert!(alice.is_peer_approved(LOCALHOST));
        assert_eq!(alice.broadcast("hello bob"), 1);
    }

    #[test]
    fn test_reject_clears_pending_and_links() {
        let (alice, alice_rx) = peer("alice");
        let (bob, bob_rx) = peer("bob");
        let bob_port = bob.local_addr().unwrap().port();

        assert!(alice.connect(LOCALHOST, bob_port));
        assert!(wait_for(|| bob.pending_requests() == vec![LOCALHOST]));

        bob.reject(LOCALHOST);
        expect_status(&bob_rx, &StatusEvent::RejectedLocally { host: LOCALHOST });
        assert!(bob.pending_requests().is_empty());
        assert!(bob.connected_peers().is_empty());

        expect_status(&alice_rx, &StatusEvent::RejectedByPeer { host: LOCALHOST });
        assert!(wait_for(|| alice.connected_peers().is_empty()));
    }

    #[test]
    fn test_accept_without_request_fails() {
        let (alice, rx) = peer("alice");
        assert!(!alice.accept(LOCALHOST));
        expect_status(&rx, &StatusEvent::AcceptFailed { host: LOCALHOST });
    }
}
