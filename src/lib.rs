//! LAN Chat Core
//!
//! Networking core of a serverless peer-to-peer chat for one local network:
//! - UDP broadcast discovery of peers
//! - TCP links gated by an accept/reject handshake
//! - A registry allowing several links per remote host
//! - Line-delimited JSON envelopes with an obfuscated payload
//!
//! Front ends drive a [`ChatPeer`] and observe it through [`PeerEvents`].

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod connection;
pub mod discovery;
pub mod events;
pub mod metrics;
pub mod obfuscation;
pub mod peer;
pub mod protocol;
pub mod registry;

mod worker;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigError, PeerConfig};
pub use connection::{Connection, ConnectionId, Direction};
pub use discovery::{DiscoveredPeer, DiscoveryService};
pub use events::{NoopEvents, PeerEvents, StatusEvent};
pub use metrics::Metrics;
pub use peer::{ChatPeer, PeerError};
pub use protocol::{DecodeError, EncodeError, Envelope, MessageKind};
pub use registry::{ConnectionInfo, ConnectionRegistry};
