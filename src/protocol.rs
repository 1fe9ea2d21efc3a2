//! Wire protocol for peer messages
//!
//! Every message, on TCP links and in UDP discovery datagrams, is an
//! [`Envelope`] serialized as one line of JSON:
//!
//! ```text
//! {"type":"message","sender":"10.0.0.7","payload":"<obfuscated>","timestamp":"2024-05-01T12:00:00.000000"}\n
//! ```
//!
//! # Message Framing
//!
//! Frames are terminated by a single `\n`. A TCP read may carry several
//! frames or only part of one, so receivers feed raw bytes into a
//! [`FrameBuffer`] and decode each complete line it yields.
//!
//! The `payload` field is passed through [`crate::obfuscation`] on encode and
//! reversed (leniently) on decode.

use serde::{Deserialize, Serialize};

use crate::obfuscation;

// ============================================================================
// Constants
// ============================================================================

/// Maximum size of a single frame, delimiter included (64 KB)
pub const MAX_FRAME_LEN: usize = 65536;

/// Frame delimiter
pub const FRAME_DELIMITER: u8 = b'\n';

// ============================================================================
// Message Kinds
// ============================================================================

/// Kind of an envelope, carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UDP broadcast asking peers to identify themselves
    Discovery,
    /// Unicast reply to a discovery broadcast
    DiscoveryResponse,
    /// Chat text, only valid on approved links
    Chat,
    /// Graceful link teardown
    Disconnect,
    /// Initiator asks the remote user to approve the link
    ConnectionRequest,
    /// Remote user approved the link
    ConnectionAccept,
    /// Remote user refused the link
    ConnectionReject,
}

impl MessageKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Discovery => "discovery",
            MessageKind::DiscoveryResponse => "discovery_response",
            MessageKind::Chat => "message",
            MessageKind::Disconnect => "disconnect",
            MessageKind::ConnectionRequest => "connection_request",
            MessageKind::ConnectionAccept => "connection_accept",
            MessageKind::ConnectionReject => "connection_reject",
        }
    }

    /// Parse a wire name, `None` for unknown kinds
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "discovery" => Some(MessageKind::Discovery),
            "discovery_response" => Some(MessageKind::DiscoveryResponse),
            "message" => Some(MessageKind::Chat),
            "disconnect" => Some(MessageKind::Disconnect),
            "connection_request" => Some(MessageKind::ConnectionRequest),
            "connection_accept" => Some(MessageKind::ConnectionAccept),
            "connection_reject" => Some(MessageKind::ConnectionReject),
            _ => None,
        }
    }

    /// Whether this kind belongs to the accept/reject handshake
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageKind::ConnectionRequest
                | MessageKind::ConnectionAccept
                | MessageKind::ConnectionReject
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A decoded wire message
///
/// `sender` is advisory: receivers overwrite it with the socket's actual peer
/// address. `payload` is always plaintext here; obfuscation only exists on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub sender: String,
    pub payload: String,
    pub timestamp: String,
}

impl Envelope {
    /// Create an envelope stamped with the current local time
    pub fn new(kind: MessageKind, sender: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            payload: payload.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn chat(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Chat, sender, content)
    }

    pub fn disconnect(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Disconnect, sender, "GOODBYE")
    }

    pub fn connection_request(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::ConnectionRequest, sender, "REQUEST_CONNECTION")
    }

    pub fn connection_accept(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::ConnectionAccept, sender, "CONNECTION_ACCEPTED")
    }

    pub fn connection_reject(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::ConnectionReject, sender, "CONNECTION_REJECTED")
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.sender, self.payload)
    }
}

/// ISO-8601 local timestamp with microseconds
fn now_timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

// ============================================================================
// Wire Representation
// ============================================================================

#[derive(Serialize)]
struct OutgoingFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    sender: &'a str,
    payload: String,
    timestamp: &'a str,
}

/// Every field optional so missing ones can be reported precisely
#[derive(Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    sender: Option<String>,
    payload: Option<String>,
    timestamp: Option<String>,
}

// ============================================================================
// Message Encoding/Decoding
// ============================================================================

/// Encode an envelope as a newline-terminated frame
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let frame = OutgoingFrame {
        kind: envelope.kind.as_str(),
        sender: &envelope.sender,
        payload: obfuscation::obfuscate(&envelope.payload),
        timestamp: &envelope.timestamp,
    };

    let mut buf =
        serde_json::to_vec(&frame).map_err(|e| EncodeError::Serialization(e.to_string()))?;
    buf.push(FRAME_DELIMITER);

    if buf.len() > MAX_FRAME_LEN {
        return Err(EncodeError::MessageTooLarge(buf.len()));
    }

    Ok(buf)
}

/// Decode one frame (with or without its trailing delimiter)
pub fn decode(frame: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| DecodeError::InvalidSyntax(format!("not UTF-8: {}", e)))?;

    let text = text.trim();
    if !text.starts_with('{') {
        return Err(DecodeError::InvalidSyntax("expected a JSON object".to_string()));
    }

    let raw: IncomingFrame =
        serde_json::from_str(text).map_err(|e| DecodeError::InvalidSyntax(e.to_string()))?;

    let kind_name = raw.kind.ok_or(DecodeError::MissingField("type"))?;
    let sender = raw.sender.ok_or(DecodeError::MissingField("sender"))?;
    let kind = MessageKind::from_wire(&kind_name).ok_or(DecodeError::UnknownKind(kind_name))?;

    let payload = raw
        .payload
        .map(|p| obfuscation::reveal_lenient(&p))
        .unwrap_or_default();

    Ok(Envelope {
        kind,
        sender,
        payload,
        timestamp: raw.timestamp.unwrap_or_else(now_timestamp),
    })
}

// ============================================================================
// Frame Buffer
// ============================================================================

/// Reassembles newline-delimited frames from a byte stream
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
    overflows: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and return every complete, non-blank frame
    ///
    /// A partial frame that grows past [`MAX_FRAME_LEN`] without a delimiter is
    /// discarded.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == FRAME_DELIMITER) {
            let mut frame: Vec<u8> = self.pending.drain(..=pos).collect();
            frame.pop();
            if !frame.iter().all(u8::is_ascii_whitespace) {
                frames.push(frame);
            }
        }

        if self.pending.len() > MAX_FRAME_LEN {
            log::warn!(
                "Discarding {} buffered bytes without a frame delimiter",
                self.pending.len()
            );
            self.pending.clear();
            self.overflows += 1;
        }

        frames
    }

    /// Bytes of an incomplete frame still waiting for a delimiter
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of oversize partial frames discarded so far
    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during envelope encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Frame exceeds maximum size
    MessageTooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::MessageTooLarge(size) => {
                write!(
                    f,
                    "message too large: {} bytes (max {})",
                    size, MAX_FRAME_LEN
                )
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// A malformed message: the frame could not be turned into an [`Envelope`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not valid UTF-8 JSON object syntax
    InvalidSyntax(String),
    /// A required field (`type` or `sender`) is absent
    MissingField(&'static str),
    /// `type` is not one of the known message kinds
    UnknownKind(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidSyntax(e) => write!(f, "malformed message: {}", e),
            DecodeError::MissingField(field) => {
                write!(f, "malformed message: missing required field '{}'", field)
            }
            DecodeError::UnknownKind(kind) => {
                write!(f, "malformed message: unknown message type '{}'", kind)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Tests
// ============================================================================
