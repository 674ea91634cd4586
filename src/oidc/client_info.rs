//! Byte layout of authorization codes and access tokens.
//!
//! ```text
//! i64 LE     issue timestamp, nanoseconds
//! u32 LE     client IPv4 address
//! u8         len(user_id)
//! u8         len(project_id)
//! ...        user_id || project_id || region
//! ```

use super::OidcError;
use crate::session::Envelope;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

const HEADER_LEN: usize = 14;

/// Authorization codes expire this long after issue.
pub const CODE_LIFETIME_SECONDS: i64 = 300;
/// Access tokens expire this long after issue.
pub const ACCESS_TOKEN_LIFETIME_SECONDS: i64 = 7200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub timestamp_ns: i64,
    pub client_ip: Ipv4Addr,
    pub user_id: String,
    pub project_id: String,
    pub region: String,
}

impl ClientInfo {
    #[must_use]
    pub fn issue(
        now: DateTime<Utc>,
        client_ip: Ipv4Addr,
        user_id: &str,
        project_id: &str,
        region: &str,
    ) -> Self {
        Self {
            timestamp_ns: now.timestamp_nanos_opt().unwrap_or(i64::MAX),
            client_ip,
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            region: region.to_string(),
        }
    }

    /// # Errors
    /// Returns an error if the user or project id does not fit its one-byte length.
    pub fn to_bytes(&self) -> Result<Vec<u8>, OidcError> {
        let user_len = u8::try_from(self.user_id.len())
            .map_err(|_| OidcError::Malformed("user id too long".to_string()))?;
        let project_len = u8::try_from(self.project_id.len())
            .map_err(|_| OidcError::Malformed("project id too long".to_string()))?;

        let mut bytes = Vec::with_capacity(
            HEADER_LEN + self.user_id.len() + self.project_id.len() + self.region.len(),
        );
        bytes.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        bytes.extend_from_slice(&u32::from(self.client_ip).to_le_bytes());
        bytes.push(user_len);
        bytes.push(project_len);
        bytes.extend_from_slice(self.user_id.as_bytes());
        bytes.extend_from_slice(self.project_id.as_bytes());
        bytes.extend_from_slice(self.region.as_bytes());
        Ok(bytes)
    }

    /// # Errors
    /// Returns an error if the buffer is shorter than its declared fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OidcError> {
        if bytes.len() < HEADER_LEN {
            return Err(OidcError::Malformed("client info too short".to_string()));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[0..8]);
        let mut ip = [0u8; 4];
        ip.copy_from_slice(&bytes[8..12]);
        let user_len = usize::from(bytes[12]);
        let project_len = usize::from(bytes[13]);

        let body = &bytes[HEADER_LEN..];
        if body.len() < user_len + project_len {
            return Err(OidcError::Malformed("client info truncated".to_string()));
        }
        let text = |slice: &[u8]| {
            String::from_utf8(slice.to_vec())
                .map_err(|_| OidcError::Malformed("client info is not utf-8".to_string()))
        };

        Ok(Self {
            timestamp_ns: i64::from_le_bytes(ts),
            client_ip: Ipv4Addr::from(u32::from_le_bytes(ip)),
            user_id: text(&body[..user_len])?,
            project_id: text(&body[user_len..user_len + project_len])?,
            region: text(&body[user_len + project_len..])?,
        })
    }

    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp_ns)
    }

    /// Whether at least `lifetime_seconds` have passed since issue.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, lifetime_seconds: i64) -> bool {
        (now - self.issued_at()).num_seconds() >= lifetime_seconds
    }

    /// Seconds left before `lifetime_seconds` elapse.
    #[must_use]
    pub fn expires_in(&self, now: DateTime<Utc>, lifetime_seconds: i64) -> i64 {
        (lifetime_seconds - (now - self.issued_at()).num_seconds()).max(0)
    }

    /// Authorization code handed to the relying party.
    ///
    /// # Errors
    /// Returns an error if the info cannot be serialized or sealed.
    pub fn encode_code(&self, envelope: &Envelope) -> Result<String, OidcError> {
        Ok(envelope.seal(&self.to_bytes()?)?)
    }

    /// # Errors
    /// Returns an error for any code this gateway did not issue.
    pub fn decode_code(code: &str, envelope: &Envelope) -> Result<Self, OidcError> {
        Self::from_bytes(&envelope.open(code)?)
    }

    /// Access token: `{"info": "<base64 bytes>"}` sealed again.
    ///
    /// # Errors
    /// Returns an error if the info cannot be serialized or sealed.
    pub fn encode_access_token(&self, envelope: &Envelope) -> Result<String, OidcError> {
        let document = AccessTokenDocument {
            info: Base64::encode_string(&self.to_bytes()?),
        };
        let json = serde_json::to_vec(&document)?;
        Ok(envelope.seal(&json)?)
    }

    /// # Errors
    /// Returns an error for any token this gateway did not issue.
    pub fn decode_access_token(token: &str, envelope: &Envelope) -> Result<Self, OidcError> {
        let document: AccessTokenDocument = serde_json::from_slice(&envelope.open(token)?)?;
        let bytes = Base64::decode_vec(&document.info)
            .map_err(|err| OidcError::Malformed(err.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct AccessTokenDocument {
    info: String,
}
