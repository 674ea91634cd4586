//! Fixed binary layout of the session token.
//!
//! ```text
//! byte 0       verify_required ('1' | '0')
//! byte 1       enabled         ('1' | '0')
//! byte 2       random salt
//! byte 3       retry_count
//! bytes 4..7   lock_expire, u32 little-endian
//! bytes 8..    session id (ASCII)
//! ```

use super::envelope::Envelope;
use thiserror::Error;

const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("token too short")]
    TooShort,
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("invalid deflate stream: {0}")]
    Deflate(String),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("malformed token: {0}")]
    Malformed(String),
}

/// Session id plus the TOTP flags carried to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub session_id: String,
    pub verify_required: bool,
    pub enabled: bool,
    pub retry_count: u8,
    pub lock_expire: u32,
}

impl SessionToken {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            verify_required: false,
            enabled: false,
            retry_count: 0,
            lock_expire: 0,
        }
    }

    #[must_use]
    pub fn encode_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.session_id.len());
        bytes.push(flag(self.verify_required));
        bytes.push(flag(self.enabled));
        bytes.push(rand::random::<u8>());
        bytes.push(self.retry_count);
        bytes.extend_from_slice(&self.lock_expire.to_le_bytes());
        bytes.extend_from_slice(self.session_id.as_bytes());
        bytes
    }

    /// Parse the fixed layout; the salt byte is discarded.
    ///
    /// # Errors
    /// Returns [`CodecError::TooShort`] below 8 bytes, or
    /// [`CodecError::Malformed`] if the identifier is not ASCII.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::TooShort);
        }
        let identifier = &bytes[HEADER_LEN..];
        if !identifier.is_ascii() {
            return Err(CodecError::Malformed("non-ascii identifier".to_string()));
        }
        let lock_expire = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            session_id: String::from_utf8_lossy(identifier).into_owned(),
            verify_required: bytes[0] == b'1',
            enabled: bytes[1] == b'1',
            retry_count: bytes[3],
            lock_expire,
        })
    }

    /// Wire form: compressed and base64url, or a compact JWE when the envelope holds a key.
    ///
    /// # Errors
    /// Returns an error if encryption fails.
    pub fn encode(&self, envelope: &Envelope) -> Result<String, CodecError> {
        envelope.seal(&self.encode_bytes())
    }

    /// # Errors
    /// Returns an error for any malformed, truncated or undecryptable input.
    pub fn decode(wire: &str, envelope: &Envelope) -> Result<Self, CodecError> {
        Self::decode_bytes(&envelope.open(wire)?)
    }
}

const fn flag(value: bool) -> u8 {
    if value { b'1' } else { b'0' }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn byte_layout_round_trips() {
        for verify_required in [false, true] {
            for enabled in [false, true] {
                for retry_count in 0..=5 {
                    for lock_expire in [0, u32::MAX] {
                        let token = SessionToken {
                            session_id: "0b5e3c4e-8f43-4a8b-9d0e-6a2f6c8c1d11".to_string(),
                            verify_required,
                            enabled,
                            retry_count,
                            lock_expire,
                        };
                        let decoded = SessionToken::decode_bytes(&token.encode_bytes()).unwrap();
                        assert_eq!(decoded, token);
                    }
                }
            }
        }
    }

    #[test]
    fn layout_positions() {
        let token = SessionToken {
            session_id: "abc".to_string(),
            verify_required: true,
            enabled: false,
            retry_count: 3,
            lock_expire: 0x0102_0304,
        };
        let bytes = token.encode_bytes();
        assert_eq!(bytes[0], b'1');
        assert_eq!(bytes[1], b'0');
        assert_eq!(bytes[3], 3);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..], b"abc");
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(matches!(
            SessionToken::decode_bytes(b"1010"),
            Err(CodecError::TooShort)
        ));
    }

    #[test]
    fn empty_identifier_is_allowed() {
        let decoded = SessionToken::decode_bytes(b"00\x07\x00\x00\x00\x00\x00").unwrap();
        assert!(decoded.session_id.is_empty());
    }
}
