//! Reversible payload obfuscation
//!
//! Chat payloads are XORed byte-wise with a fixed shared key and then base64
//! encoded so the wire form is not plain text. This is NOT encryption: the key
//! ships with every peer and the transform is trivially reversible.
//!
//! ```text
//! plaintext (UTF-8) ──XOR key──► bytes ──base64──► wire payload
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

// ============================================================================
// Constants
// ============================================================================

/// Shared key every peer uses (must match all other peers on the LAN)
pub const SHARED_KEY: &[u8] = b"P2PChatSecretKey2024!@#$";

// ============================================================================
// Transform
// ============================================================================

fn xor_with_key(data: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(SHARED_KEY.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

/// Obfuscate a plaintext payload for the wire
pub fn obfuscate(plaintext: &str) -> String {
    STANDARD.encode(xor_with_key(plaintext.as_bytes()))
}

/// Reverse [`obfuscate`]
///
/// Fails if the input is not canonical base64 or the unmasked bytes are not
/// valid UTF-8.
pub fn reveal(encoded: &str) -> Result<String, RevealError> {
    let masked = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| RevealError::Base64(e.to_string()))?;

    String::from_utf8(xor_with_key(&masked)).map_err(|_| RevealError::NotUtf8)
}

/// Reverse [`obfuscate`], passing the input through unchanged if it does not
/// reverse cleanly
///
/// Older peers send cleartext payloads; those must still be readable.
pub fn reveal_lenient(payload: &str) -> String {
    match reveal(payload) {
        Ok(plain) => plain,
        Err(e) => {
            log::debug!("Payload not obfuscated ({}), treating as cleartext", e);
            payload.to_string()
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while reversing an obfuscated payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealError {
    /// Payload is not valid base64
    Base64(String),
    /// Unmasked bytes are not valid UTF-8
    NotUtf8,
}

impl std::fmt::Display for RevealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevealError::Base64(e) => write!(f, "invalid base64: {}", e),
            RevealError::NotUtf8 => write!(f, "unmasked payload is not UTF-8"),
        }
    }
}

impl std::error::Error for RevealError {}
