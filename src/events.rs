//! Observer interface between the networking core and its front end
//!
//! The core never renders anything itself. Registry, discovery and the
//! orchestrator report what happened through [`PeerEvents`], one method per
//! event kind. Every method has a no-op default so observers only implement
//! what they display.

use std::net::IpAddr;

use crate::discovery::DiscoveredPeer;
use crate::protocol::Envelope;

/// Callbacks fired from network threads
///
/// Implementations must be cheap and must not block: they run on the receive,
/// accept and discovery threads.
pub trait PeerEvents: Send + Sync {
    /// An envelope arrived on a link: chat on approved links, or one of the
    /// handshake kinds
    fn message_received(&self, _host: IpAddr, _port: u16, _envelope: &Envelope) {}

    /// A new TCP link (inbound or outbound) was registered
    fn peer_connected(&self, _host: IpAddr) {}

    /// An approved link was torn down
    fn peer_disconnected(&self, _host: IpAddr, _port: u16) {}

    /// Discovery found a peer not seen in the current scan round
    fn peer_discovered(&self, _peer: &DiscoveredPeer) {}

    /// Human-readable outcome of a control-surface operation
    fn status(&self, _event: &StatusEvent) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl PeerEvents for NoopEvents {}

// ============================================================================
// Status Events
// ============================================================================

/// Outcomes the front end should show the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// The TCP listener could not bind
    ServerStartFailed { port: u16 },
    /// Outbound TCP connect failed
    ConnectFailed { host: IpAddr, port: u16 },
    /// Outbound link is up and the request was sent
    AwaitingApproval { host: IpAddr, port: u16 },
    /// No pending link to accept
    AcceptFailed { host: IpAddr },
    /// Local user approved a pending link
    Accepted { host: IpAddr },
    /// Local user refused a host
    RejectedLocally { host: IpAddr },
    /// Remote user refused our request
    RejectedByPeer { host: IpAddr },
    /// Remote user approved our request
    ApprovedByPeer { host: IpAddr },
    /// A chat could not be delivered to any approved link
    NoApprovedPeers,
    /// A discovery round finished
    DiscoveryFinished { found: usize },
}

impl std::fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusEvent::ServerStartFailed { port } => {
                write!(f, "Could not start TCP server on port {}. Port may be in use.", port)
            }
            StatusEvent::ConnectFailed { host, port } => {
                write!(f, "Could not connect to {}:{}", host, port)
            }
            StatusEvent::AwaitingApproval { host, port } => {
                write!(f, "Connected to {}:{}, waiting for approval...", host, port)
            }
            StatusEvent::AcceptFailed { host } => {
                write!(f, "Could not accept connection from {}", host)
            }
            StatusEvent::Accepted { host } => write!(f, "Accepted connection from {}", host),
            StatusEvent::RejectedLocally { host } => {
                write!(f, "Rejected connection from {}", host)
            }
            StatusEvent::RejectedByPeer { host } => write!(f, "Connection rejected by {}", host),
            StatusEvent::ApprovedByPeer { host } => {
                write!(f, "Connection accepted by {}. You can now chat!", host)
            }
            StatusEvent::NoApprovedPeers => {
                write!(f, "Failed to send message. No approved connections.")
            }
            StatusEvent::DiscoveryFinished { found: 0 } => {
                write!(f, "No peers found on the network.")
            }
            StatusEvent::DiscoveryFinished { found } => write!(f, "Found {} peer(s)", found),
        }
    }
}
