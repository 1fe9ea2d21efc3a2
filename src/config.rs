//! Runtime configuration for a chat peer

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

// ============================================================================
// Constants
// ============================================================================

/// Default TCP port for peer links
pub const DEFAULT_TCP_PORT: u16 = 5000;

/// Default UDP port for discovery broadcasts
pub const DEFAULT_DISCOVERY_PORT: u16 = 5001;

/// Display name used when none is configured
pub const DEFAULT_DISPLAY_NAME: &str = "User";

/// Longest accepted display name, in characters
pub const MAX_DISPLAY_NAME_LEN: usize = 12;

/// Public address used only to pick the outbound interface (nothing is sent)
const ROUTE_TARGET_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

// ============================================================================
// Peer Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Address this peer advertises and binds discovery to
    pub local_host: IpAddr,
    /// TCP listening port (0 picks an ephemeral port)
    pub tcp_port: u16,
    /// UDP discovery port
    pub discovery_port: u16,
    /// Name shown to other peers
    pub display_name: String,
    /// Verbose logging requested on the command line
    pub debug: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            local_host: detect_local_ip(),
            tcp_port: DEFAULT_TCP_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            debug: false,
        }
    }
}

impl PeerConfig {
    /// Parse command line flags on top of the defaults
    ///
    /// `--port/-p <tcp>`, `--broadcast-port/-b <udp>`, `--username/-u <name>`,
    /// `--host <ip>`, `--debug/-d`. The first element (program name) is skipped.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = PeerConfig::default();

        if let Some(port) = parse_arg(args, &["--port", "-p"]) {
            config.tcp_port = parse_port("--port", &port)?;
        }
        if let Some(port) = parse_arg(args, &["--broadcast-port", "-b"]) {
            config.discovery_port = parse_port("--broadcast-port", &port)?;
        }
        if let Some(name) = parse_arg(args, &["--username", "-u"]) {
            config.display_name = name;
        }
        if let Some(host) = parse_arg(args, &["--host"]) {
            config.local_host = host
                .parse()
                .map_err(|_| ConfigError::InvalidValue("--host", host.clone()))?;
        }
        config.debug = args.iter().skip(1).any(|a| a == "--debug" || a == "-d");

        config.validate()?;
        Ok(config)
    }

    /// Check the display name can travel in a discovery payload
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_display_name(&self.display_name)
    }
}

/// Value following the first matching flag
fn parse_arg(args: &[String], flags: &[&str]) -> Option<String> {
    args.iter()
        .position(|a| flags.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_port(flag: &'static str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue(flag, value.to_string()))
}

/// Non-empty, at most [`MAX_DISPLAY_NAME_LEN`] characters, no `:` or newline
pub fn validate_display_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidDisplayName("display name is empty".into()));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(ConfigError::InvalidDisplayName(format!(
            "display name must be {} characters or less",
            MAX_DISPLAY_NAME_LEN
        )));
    }
    if name.contains(':') || name.contains('\n') {
        return Err(ConfigError::InvalidDisplayName(
            "display name must not contain ':' or newlines".into(),
        ));
    }
    Ok(())
}

// ============================================================================
// Local Address Detection
// ============================================================================

/// Address of the interface used for outbound traffic
///
/// Connecting a UDP socket only selects a route; no packet is sent. Falls back
/// to loopback when there is no route (offline hosts, sandboxes).
pub fn detect_local_ip() -> IpAddr {
    let outbound_ip = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(ROUTE_TARGET_ADDR)?;
        Ok(socket.local_addr()?.ip())
    };

    match outbound_ip() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) | Err(_) => {
            log::debug!("No outbound route, using loopback as local address");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A flag's value could not be parsed
    InvalidValue(&'static str, String),
    /// Display name rejected by [`validate_display_name`]
    InvalidDisplayName(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(flag, value) => {
                write!(f, "invalid value for {}: '{}'", flag, value)
            }
            ConfigError::InvalidDisplayName(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("lan-chat")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = PeerConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config.tcp_port, DEFAULT_TCP_PORT);
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.display_name, DEFAULT_DISPLAY_NAME);
        assert!(!config.debug);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = PeerConfig::from_args(&args(&[
            "-p", "5002", "--broadcast-port", "6001", "-u", "MERT", "--host", "127.0.0.1", "-d",
        ]))
        .unwrap();

        assert_eq!(config.tcp_port, 5002);
        assert_eq!(config.discovery_port, 6001);
        assert_eq!(config.display_name, "MERT");
        assert_eq!(config.local_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(config.debug);
    }

    #[test]
    fn test_invalid_port() {
        assert_eq!(
            PeerConfig::from_args(&args(&["--port", "70000"])),
            Err(ConfigError::InvalidValue("--port", "70000".to_string()))
        );
    }

    #[test]
    fn test_display_name_rules() {
        assert!(validate_display_name("SONER").is_ok());
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name("averyverylongname").is_err());
        assert!(validate_display_name("a:b").is_err());
    }

    #[test]
    fn test_detect_local_ip_is_specified() {
        assert!(!detect_local_ip().is_unspecified());
    }
}
