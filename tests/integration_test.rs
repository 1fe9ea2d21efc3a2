//! End-to-end tests over loopback sockets
//!
//! Registries listen on ephemeral ports; raw `std::net` sockets stand in for
//! peers that misbehave or that the test needs to inspect on the wire.

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lan_chat::discovery::DiscoveryService;
use lan_chat::obfuscation;
use lan_chat::protocol::{self, Envelope, MessageKind};
use lan_chat::registry::ConnectionRegistry;
use lan_chat::PeerEvents;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(300);

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Message(IpAddr, u16, Envelope),
    Connected(IpAddr),
    Disconnected(IpAddr, u16),
}

struct Recorder(Mutex<Sender<Event>>);

impl Recorder {
    fn send(&self, event: Event) {
        let _ = self.0.lock().unwrap().send(event);
    }
}

impl PeerEvents for Recorder {
    fn message_received(&self, host: IpAddr, port: u16, envelope: &Envelope) {
        self.send(Event::Message(host, port, envelope.clone()));
    }

    fn peer_connected(&self, host: IpAddr) {
        self.send(Event::Connected(host));
    }

    fn peer_disconnected(&self, host: IpAddr, port: u16) {
        self.send(Event::Disconnected(host, port));
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Started registry on an ephemeral port, with its event stream
fn registry() -> (ConnectionRegistry, Receiver<Event>, u16) {
    init_logging();
    let (tx, rx) = mpsc::channel();
    let registry = ConnectionRegistry::new(LOCALHOST, 0);
    registry.set_events(Arc::new(Recorder(Mutex::new(tx))));
    assert!(registry.start_server());
    let port = registry.local_addr().unwrap().port();
    (registry, rx, port)
}

/// Next event matching `pred`, skipping others
fn next_matching(rx: &Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Option<Event> {
    next_matching_within(rx, WAIT, pred)
}

fn next_matching_within(
    rx: &Receiver<Event>,
    window: Duration,
    pred: impl Fn(&Event) -> bool,
) -> Option<Event> {
    let deadline = Instant::now() + window;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

fn message_of_kind(rx: &Receiver<Event>, kind: MessageKind) -> Option<Envelope> {
    match next_matching(rx, |e| matches!(e, Event::Message(_, _, env) if env.kind == kind))? {
        Event::Message(_, _, env) => Some(env),
        _ => None,
    }
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

fn write_frame(stream: &mut TcpStream, envelope: &Envelope) {
    stream.write_all(&protocol::encode(envelope).unwrap()).unwrap();
}

fn read_frame(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line
}

/// Two registries with an approved link from `a` to `b`
fn approved_pair() -> (
    (ConnectionRegistry, Receiver<Event>, u16),
    (ConnectionRegistry, Receiver<Event>, u16),
) {
    let a = registry();
    let b = registry();

    assert!(a.0.connect_to_peer(LOCALHOST, b.2));
    assert!(a.0.request_connection(LOCALHOST, b.2));
    assert!(message_of_kind(&b.1, MessageKind::ConnectionRequest).is_some());

    assert!(b.0.accept_connection(LOCALHOST));
    assert!(message_of_kind(&a.1, MessageKind::ConnectionAccept).is_some());
    (a, b)
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn test_handshake_then_chat_both_ways() {
    let ((a, a_rx, _), (b, b_rx, b_port)) = approved_pair();

    assert!(a.is_peer_approved(LOCALHOST));
    assert!(b.is_peer_approved(LOCALHOST));
    assert!(a.connections().iter().all(|c| c.port == b_port && c.approved));

    assert!(a.send_to_peer(LOCALHOST, "merhaba"));
    let chat = message_of_kind(&b_rx, MessageKind::Chat).unwrap();
    assert_eq!(chat.payload, "merhaba");
    assert_eq!(chat.sender, LOCALHOST.to_string());

    assert_eq!(b.broadcast_message("selam"), 1);
    assert_eq!(message_of_kind(&a_rx, MessageKind::Chat).unwrap().payload, "selam");
}

#[test]
fn test_chat_on_unapproved_link_is_dropped() {
    let (b, b_rx, b_port) = registry();
    let mut raw = TcpStream::connect((LOCALHOST, b_port)).unwrap();
    assert!(wait_for(|| b.connections().len() == 1));

    write_frame(&mut raw, &Envelope::chat("10.9.9.9", "let me in"));
    assert!(wait_for(|| b.metrics().frames_dropped_total.load(Ordering::Relaxed) == 1));

    let leaked = next_matching_within(&b_rx, QUIET, |e| matches!(e, Event::Message(..)));
    assert_eq!(leaked, None);
    assert!(!b.is_peer_approved(LOCALHOST));
}

#[test]
fn test_unapproved_sender_cannot_send() {
    let (a, _a_rx, _) = registry();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    assert!(a.connect_to_peer(LOCALHOST, port));
    assert!(!a.send_to_peer(LOCALHOST, "too early"));
    assert_eq!(a.broadcast_message("too early"), 0);
}

#[test]
fn test_reject_closes_all_links_and_notifies_requester() {
    let (b, b_rx, b_port) = registry();
    let raw = TcpStream::connect((LOCALHOST, b_port)).unwrap();
    raw.set_read_timeout(Some(WAIT)).unwrap();
    let mut writer = raw.try_clone().unwrap();
    let mut reader = BufReader::new(raw);

    write_frame(&mut writer, &Envelope::connection_request("127.0.0.1"));
    assert!(message_of_kind(&b_rx, MessageKind::ConnectionRequest).is_some());

    b.reject_connection(LOCALHOST);
    assert!(b.connected_peers().is_empty());
    assert!(b.connections().is_empty());

    let reply = protocol::decode(read_frame(&mut reader).as_bytes()).unwrap();
    assert_eq!(reply.kind, MessageKind::ConnectionReject);
}

#[test]
fn test_requester_link_closes_on_reject() {
    let (a, a_rx, _) = registry();
    let (b, b_rx, b_port) = registry();

    assert!(a.connect_to_peer(LOCALHOST, b_port));
    assert!(a.request_connection(LOCALHOST, b_port));
    assert!(message_of_kind(&b_rx, MessageKind::ConnectionRequest).is_some());

    b.reject_connection(LOCALHOST);
    assert!(message_of_kind(&a_rx, MessageKind::ConnectionReject).is_some());
    assert!(wait_for(|| a.connected_peers().is_empty()));
}

#[test]
fn test_accept_without_pending_link_fails() {
    let (b, _rx, _) = registry();
    assert!(!b.accept_connection(LOCALHOST));
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_disconnect_fires_once_for_approved_link_only() {
    let ((_a, _a_rx, _), (b, b_rx, b_port)) = approved_pair();
    let approved_port = b.connections().iter().find(|c| c.approved).unwrap().port;

    // Second, unapproved link from the same host
    let _raw = TcpStream::connect((LOCALHOST, b_port)).unwrap();
    assert!(wait_for(|| b.connections().len() == 2));

    assert!(b.disconnect_peer(LOCALHOST));
    assert!(b.connections().is_empty());

    let first = next_matching(&b_rx, |e| matches!(e, Event::Disconnected(..)));
    assert_eq!(first, Some(Event::Disconnected(LOCALHOST, approved_port)));
    assert_eq!(
        next_matching_within(&b_rx, QUIET, |e| matches!(e, Event::Disconnected(..))),
        None
    );
}

#[test]
fn test_remote_disconnect_removes_link() {
    let ((a, _a_rx, _), (b, b_rx, _)) = approved_pair();

    assert!(a.disconnect_peer(LOCALHOST));
    assert!(next_matching(&b_rx, |e| matches!(e, Event::Disconnected(..))).is_some());
    assert!(wait_for(|| b.connected_peers().is_empty()));
}

#[test]
fn test_broadcast_counts_approved_links() {
    let ((a, _a_rx, _), (_b, _b_rx, _)) = approved_pair();
    let (c, c_rx, c_port) = registry();

    assert!(a.connect_to_peer(LOCALHOST, c_port));
    assert!(wait_for(|| c.connections().len() == 1));
    assert_eq!(a.broadcast_message("only b"), 1);

    assert!(a.request_connection(LOCALHOST, c_port));
    assert!(message_of_kind(&c_rx, MessageKind::ConnectionRequest).is_some());
    assert!(c.accept_connection(LOCALHOST));
    assert!(wait_for(|| a.connections().iter().all(|l| l.approved)));
    assert_eq!(a.broadcast_message("both"), 2);
}

#[test]
fn test_malformed_frames_do_not_break_link() {
    let (b, b_rx, b_port) = registry();
    let mut raw = TcpStream::connect((LOCALHOST, b_port)).unwrap();

    raw.write_all(b"not json at all\n{\"type\":\"bogus\",\"sender\":\"x\"}\n\n")
        .unwrap();
    write_frame(&mut raw, &Envelope::connection_request("127.0.0.1"));

    assert!(message_of_kind(&b_rx, MessageKind::ConnectionRequest).is_some());
    assert_eq!(b.connections().len(), 1);
    assert_eq!(b.metrics().frames_dropped_total.load(Ordering::Relaxed), 2);
}

#[test]
fn test_frames_split_across_writes() {
    let (_b, b_rx, b_port) = registry();
    let mut raw = TcpStream::connect((LOCALHOST, b_port)).unwrap();
    raw.set_nodelay(true).unwrap();

    let frame = protocol::encode(&Envelope::connection_request("127.0.0.1")).unwrap();
    let (head, tail) = frame.split_at(frame.len() / 2);
    raw.write_all(head).unwrap();
    thread::sleep(Duration::from_millis(50));
    raw.write_all(tail).unwrap();

    assert!(message_of_kind(&b_rx, MessageKind::ConnectionRequest).is_some());
}

// ============================================================================
// Wire Format
// ============================================================================

#[test]
fn test_chat_payload_is_obfuscated_on_wire() {
    let (a, _a_rx, _) = registry();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    assert!(a.connect_to_peer(LOCALHOST, port));
    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    write_frame(&mut writer, &Envelope::connection_accept("127.0.0.1"));
    assert!(wait_for(|| a.is_peer_approved(LOCALHOST)));
    assert!(a.send_to_peer(LOCALHOST, "gizli mesaj"));

    let line = read_frame(&mut reader);
    let raw: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(raw["type"], "message");
    assert_eq!(raw["sender"], "127.0.0.1");
    let wire_payload = raw["payload"].as_str().unwrap();
    assert_ne!(wire_payload, "gizli mesaj");
    assert_eq!(obfuscation::reveal(wire_payload).unwrap(), "gizli mesaj");
    assert!(raw["timestamp"].as_str().is_some());
}

#[test]
fn test_cleartext_payload_from_legacy_peer_is_accepted() {
    let (c, c_rx, c_port) = registry();
    let mut raw = TcpStream::connect((LOCALHOST, c_port)).unwrap();
    write_frame(&mut raw, &Envelope::connection_request("127.0.0.1"));
    assert!(message_of_kind(&c_rx, MessageKind::ConnectionRequest).is_some());
    assert!(c.accept_connection(LOCALHOST));

    raw.write_all(b"{\"type\":\"message\",\"sender\":\"x\",\"payload\":\"plain text!\"}\n")
        .unwrap();
    let chat = message_of_kind(&c_rx, MessageKind::Chat).unwrap();
    assert_eq!(chat.payload, "plain text!");
}

// ============================================================================
// Discovery
// ============================================================================

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn test_discovery_over_loopback() {
    init_logging();
    let port = free_udp_port();

    let bob = DiscoveryService::new(LOCALHOST, port, 7001, "bob");
    assert!(bob.start_listening());

    let alice = DiscoveryService::new(LOCALHOST, port, 7000, "alice");
    let found = alice.announce(Duration::from_millis(800));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].host, LOCALHOST);
    assert_eq!(found[0].port, 7001);
    assert_eq!(found[0].display_name, "bob");

    // A second round without clearing keeps the set, not duplicates
    let again = alice.announce(Duration::from_millis(400));
    assert_eq!(again.len(), 1);
}

#[test]
fn test_discovery_ignores_own_announcement() {
    init_logging();
    let port = free_udp_port();

    let solo = DiscoveryService::new(LOCALHOST, port, 7002, "solo");
    assert!(solo.start_listening());
    assert!(solo.announce(Duration::from_millis(500)).is_empty());
}

#[test]
fn test_discovery_two_peers_share_port_on_loopback() {
    init_logging();
    let port = free_udp_port();

    let a = DiscoveryService::new(LOCALHOST, port, 7020, "a");
    let b = DiscoveryService::new(LOCALHOST, port, 7021, "b");
    assert!(a.start_listening());
    assert!(b.start_listening());

    for _ in 0..10 {
        a.clear_discovered();
        b.clear_discovered();

        let from_a: Vec<u16> = a
            .announce(Duration::from_millis(300))
            .iter()
            .map(|p| p.port)
            .collect();
        let from_b: Vec<u16> = b
            .announce(Duration::from_millis(300))
            .iter()
            .map(|p| p.port)
            .collect();
        assert_eq!(from_a, vec![7021]);
        assert_eq!(from_b, vec![7020]);
    }
}

#[test]
#[ignore = "requires a broadcast-capable LAN interface"]
fn test_discovery_two_peers_on_shared_port() {
    init_logging();
    let host = lan_chat::config::detect_local_ip();
    let port = free_udp_port();

    let a = DiscoveryService::new(host, port, 7010, "a");
    let b = DiscoveryService::new(host, port, 7011, "b");
    assert!(a.start_listening());
    assert!(b.start_listening());

    let from_a = a.announce(Duration::from_secs(2));
    assert!(from_a.iter().any(|p| p.port == 7011));
    assert!(from_a.iter().all(|p| p.port != 7010));
}
