//! Gateway-as-IDP building blocks: authorization codes, access tokens,
//! RS256 ID tokens and the JWKS document.

mod client_info;
mod jwks;
mod jwt;

pub use client_info::{ACCESS_TOKEN_LIFETIME_SECONDS, CODE_LIFETIME_SECONDS, ClientInfo};
pub use jwks::{Jwk, Jwks, key_id};
pub use jwt::{IdTokenClaims, sign_id_token};
#[cfg(test)]
pub use jwt::verify_id_token;

use crate::session::CodecError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[cfg(test)]
    #[error("invalid signature")]
    InvalidSignature,
    #[cfg(test)]
    #[error("invalid issuer or audience")]
    InvalidClaims,
    #[cfg(test)]
    #[error("token expired")]
    Expired,
}

/// Path under the public API server where the provider endpoints live.
pub const OIDC_PATH: &str = "/api/v1/auth/oidc";

/// `/.well-known/openid-configuration`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub end_session_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<&'static str>,
    pub subject_types_supported: Vec<&'static str>,
    pub id_token_signing_alg_values_supported: Vec<&'static str>,
    pub scopes_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub claims_supported: Vec<&'static str>,
}

/// Issuer URL for a public API server base, e.g. `https://gw.example`.
#[must_use]
pub fn issuer(api_server: &str) -> String {
    format!("{}{OIDC_PATH}", api_server.trim_end_matches('/'))
}

#[must_use]
pub fn discovery(api_server: &str) -> DiscoveryDocument {
    let issuer = issuer(api_server);
    DiscoveryDocument {
        authorization_endpoint: format!("{issuer}/auth"),
        token_endpoint: format!("{issuer}/token"),
        userinfo_endpoint: format!("{issuer}/user"),
        end_session_endpoint: format!("{issuer}/logout"),
        jwks_uri: format!("{issuer}/keys"),
        issuer,
        response_types_supported: vec!["code"],
        subject_types_supported: vec!["public"],
        id_token_signing_alg_values_supported: vec!["RS256"],
        scopes_supported: vec!["user", "profile"],
        token_endpoint_auth_methods_supported: vec!["client_secret_basic"],
        claims_supported: vec!["iss", "sub", "aud", "exp", "iat"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_endpoints_hang_off_issuer() {
        let doc = discovery("https://gw.example/");
        assert_eq!(doc.issuer, "https://gw.example/api/v1/auth/oidc");
        assert_eq!(doc.token_endpoint, "https://gw.example/api/v1/auth/oidc/token");
        assert_eq!(doc.jwks_uri, "https://gw.example/api/v1/auth/oidc/keys");
        assert_eq!(doc.response_types_supported, vec!["code"]);
        assert_eq!(doc.id_token_signing_alg_values_supported, vec!["RS256"]);
    }
}
