//! LAN Chat console
//!
//! Line-oriented front end for a [`ChatPeer`]:
//! - `/commands` drive discovery and the connection handshake
//! - Any other line is broadcast to every approved peer
//! - SIGINT/SIGTERM stop the peer cleanly

use std::io::{self, BufRead};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lan_chat::config::DEFAULT_TCP_PORT;
use lan_chat::peer::DEFAULT_DISCOVERY_TIMEOUT;
use lan_chat::{ChatPeer, DiscoveredPeer, Envelope, MessageKind, PeerConfig, PeerEvents, StatusEvent};

// ============================================================================
// Constants
// ============================================================================

/// How often the input loop re-checks the shutdown flag
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const USAGE: &str = "\
Usage: lan-chat [options]
  -p, --port <port>            TCP port for peer links (default 5000)
  -b, --broadcast-port <port>  UDP discovery port (default 5001)
  -u, --username <name>        Display name, up to 12 characters
      --host <ip>              Local address to advertise (default: auto-detect)
  -d, --debug                  Verbose logging";

const HELP: &str = "\
Commands:
  /discover               Search the local network for peers
  /connect <ip> [port]    Connect to a peer and request approval
  /accept <ip>            Approve a pending connection request
  /reject <ip>            Refuse a connection request
  /disconnect <ip>        Close every link to a peer
  /list                   Show links, pending requests and discovered peers
  /stats                  Show peer metrics
  /help                   Show this help
  /quit                   Exit
Anything else is sent to all approved peers.";

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().skip(1).any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = PeerConfig::from_args(&args)?;

    // Initialize logging
    let default_filter = if config.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let peer = ChatPeer::new(config, Arc::new(Console))?;
    peer.start()?;

    let config = peer.config();
    println!(
        "LAN Chat - {} on {}:{} (discovery port {})",
        config.display_name,
        config.local_host,
        peer.local_addr().map_or(config.tcp_port, |a| a.port()),
        config.discovery_port
    );
    println!("Type /help for commands.");

    let lines = spawn_stdin_reader()?;
    while !shutdown.load(Ordering::SeqCst) {
        match lines.recv_timeout(INPUT_POLL_INTERVAL) {
            Ok(line) => {
                if !run_line(&peer, &line) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("Shutting down...");
    peer.stop();
    Ok(())
}

/// Stdin lines on a channel so the main loop can also watch for signals
fn spawn_stdin_reader() -> io::Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Discover,
    Connect(IpAddr, u16),
    Accept(IpAddr),
    Reject(IpAddr),
    Disconnect(IpAddr),
    List,
    Stats,
    Help,
    Quit,
    Say(String),
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if !line.starts_with('/') {
        return Ok(Command::Say(line.to_string()));
    }

    let mut parts = line.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match name {
        "/discover" => Ok(Command::Discover),
        "/connect" => parse_target(&args).map(|(host, port)| Command::Connect(host, port)),
        "/accept" => parse_host(&args).map(Command::Accept),
        "/reject" => parse_host(&args).map(Command::Reject),
        "/disconnect" => parse_host(&args).map(Command::Disconnect),
        "/list" => Ok(Command::List),
        "/stats" => Ok(Command::Stats),
        "/help" => Ok(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command: {} (try /help)", other)),
    }
}

fn parse_host(args: &[&str]) -> Result<IpAddr, String> {
    let arg = args.first().ok_or("Missing IP address")?;
    arg.parse().map_err(|_| format!("Invalid IP address: {}", arg))
}

/// `<ip>`, `<ip> <port>` or `<ip:port>`
fn parse_target(args: &[&str]) -> Result<(IpAddr, u16), String> {
    let arg = args.first().ok_or("Missing IP address")?;
    if let Ok(addr) = arg.parse::<SocketAddr>() {
        return Ok((addr.ip(), addr.port()));
    }

    let host = parse_host(args)?;
    let port = match args.get(1) {
        Some(p) => p.parse().map_err(|_| format!("Invalid port: {}", p))?,
        None => DEFAULT_TCP_PORT,
    };
    Ok((host, port))
}

/// Execute one input line; false once the user quits
fn run_line(peer: &ChatPeer, line: &str) -> bool {
    if line.trim().is_empty() {
        return true;
    }

    let command = match parse_command(line) {
        Ok(c) => c,
        Err(e) => {
            println!("[System] {}", e);
            return true;
        }
    };

    match command {
        Command::Discover => {
            println!("[System] Searching for peers...");
            for found in peer.discover(DEFAULT_DISCOVERY_TIMEOUT) {
                println!("  {}", found);
            }
        }
        Command::Connect(host, port) => {
            peer.connect(host, port);
        }
        Command::Accept(host) => {
            peer.accept(host);
        }
        Command::Reject(host) => peer.reject(host),
        Command::Disconnect(host) => {
            if peer.disconnect(host) {
                println!("[System] Disconnected from {}", host);
            } else {
                println!("[System] Not connected to {}", host);
            }
        }
        Command::List => print_list(peer),
        Command::Stats => print!("{}", peer.metrics().render()),
        Command::Help => println!("{}", HELP),
        Command::Quit => return false,
        Command::Say(text) => {
            let delivered = peer.broadcast(&text);
            if delivered > 0 {
                println!("[{}] You: {}", clock(), text);
            }
        }
    }
    true
}

fn print_list(peer: &ChatPeer) {
    let links = peer.connections();
    if links.is_empty() {
        println!("[System] No connections");
    }
    for link in links {
        println!(
            "  {}:{} {:?} {}",
            link.host,
            link.port,
            link.direction,
            if link.approved { "approved" } else { "pending" }
        );
    }

    for host in peer.pending_requests() {
        println!("  request from {} (/accept {} or /reject {})", host, host, host);
    }

    let discovered = peer.discovered_peers();
    if !discovered.is_empty() {
        println!("[System] Discovered:");
        for found in discovered {
            println!("  {}", found);
        }
    }
}

fn clock() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

// ============================================================================
// Console Observer
// ============================================================================

struct Console;

impl PeerEvents for Console {
    fn message_received(&self, host: IpAddr, _port: u16, envelope: &Envelope) {
        match envelope.kind {
            MessageKind::Chat => println!("[{}] {}: {}", clock(), host, envelope.payload),
            MessageKind::ConnectionRequest => println!(
                "[System] Connection request from {}. Type /accept {} or /reject {}",
                host, host, host
            ),
            _ => {}
        }
    }

    fn peer_disconnected(&self, host: IpAddr, port: u16) {
        println!("[System] {}:{} disconnected", host, port);
    }

    fn peer_discovered(&self, peer: &DiscoveredPeer) {
        println!("[System] Discovered {}", peer);
    }

    fn status(&self, event: &StatusEvent) {
        println!("[System] {}", event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_plain_line_is_chat() {
        assert_eq!(parse_command("  hello all "), Ok(Command::Say("hello all".into())));
    }

    #[test]
    fn test_connect_forms() {
        assert_eq!(
            parse_command("/connect 192.168.1.7"),
            Ok(Command::Connect(ip("192.168.1.7"), DEFAULT_TCP_PORT))
        );
        assert_eq!(
            parse_command("/connect 192.168.1.7 5002"),
            Ok(Command::Connect(ip("192.168.1.7"), 5002))
        );
        assert_eq!(
            parse_command("/connect 192.168.1.7:5003"),
            Ok(Command::Connect(ip("192.168.1.7"), 5003))
        );
        assert!(parse_command("/connect").is_err());
        assert!(parse_command("/connect 192.168.1.7 http").is_err());
    }

    #[test]
    fn test_host_commands() {
        assert_eq!(parse_command("/accept 10.0.0.2"), Ok(Command::Accept(ip("10.0.0.2"))));
        assert_eq!(parse_command("/reject 10.0.0.2"), Ok(Command::Reject(ip("10.0.0.2"))));
        assert_eq!(
            parse_command("/disconnect 10.0.0.2"),
            Ok(Command::Disconnect(ip("10.0.0.2")))
        );
        assert!(parse_command("/accept nobody").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse_command("/frobnicate").is_err());
        assert_eq!(parse_command("/quit"), Ok(Command::Quit));
    }
}
