//! # apigateway (session and authentication core)
//!
//! `apigateway` is the single HTTP entry point in front of the control-plane
//! services. This crate holds the part of it that decides who the caller is.
//!
//! ## Sessions
//!
//! A successful login leaves a server-side session keyed by a UUID. The browser
//! only sees the session id wrapped in a compact binary token that also carries
//! the TOTP flags. The token is either deflated and base64url encoded or sealed
//! in an `RSA1_5`/`A128GCM` JWE when an RSA key is installed. Sessions live in
//! memory and are persisted to a single `SQLite` file in the background, so they
//! survive restarts.
//!
//! ## Second factor
//!
//! When the global TOTP switch is on, users flagged `enable_mfa` must submit a
//! valid RFC 6238 passcode before any protected handler runs. Five wrong codes
//! lock the session for thirty seconds.
//!
//! ## Federation
//!
//! Users log in with a password, a CAS ticket, an assume token, or through an
//! external IDP (SAML, OIDC, `OAuth2`, CAS). The gateway is itself an OIDC
//! provider for relying parties that federate its user base.
//!
//! Identities are never stored here: every decision is delegated to the
//! identity backend through [`identity::IdentityBackend`].

pub mod admin;
pub mod api;
pub mod cli;
pub mod error;
pub mod identity;
pub mod oidc;
pub mod session;
pub mod totp;

#[cfg(test)]
pub(crate) mod test_support;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
