//! Session resolution and issuance.
//!
//! Clients carry the wire token either in the `X-Yunion-Auth` header or in the
//! `session` field of the `yunion_auth` cookie; the header wins. The store stays
//! authoritative for TOTP state, so flags inside the token are informational.

use axum::http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{InvalidHeaderValue, SET_COOKIE},
};
use tracing::debug;

use super::{
    cookies::{AUTH_COOKIE, AuthCookie, read_cookie, set_cookie},
    state::AuthState,
    utils::strip_bearer,
};
use crate::{
    error::{ApiError, ApiResult},
    identity::BackendToken,
    session::SessionToken,
    totp::TotpState,
};

pub const AUTH_HEADER: HeaderName = HeaderName::from_static("x-yunion-auth");

/// Resolved session, attached to request extensions by the middleware.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub wire: String,
    pub token: BackendToken,
    pub totp: TotpState,
    pub is_sso: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Gate {
    /// Reject sessions whose second factor is still pending.
    Totp,
    /// Let pending sessions through, for the enrollment and passcode handlers.
    SkipTotp,
}

/// Wire token from the header, falling back to the cookie.
pub(super) fn extract_wire_token(headers: &HeaderMap) -> Option<String> {
    if let Some(wire) = headers
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(strip_bearer)
    {
        return Some(wire);
    }
    auth_cookie(headers)
        .map(|cookie| cookie.session)
        .filter(|session| !session.is_empty())
}

pub(super) fn auth_cookie(headers: &HeaderMap) -> Option<AuthCookie> {
    AuthCookie::decode(&read_cookie(headers, AUTH_COOKIE)?)
}

pub(super) async fn resolve_session(
    state: &AuthState,
    headers: &HeaderMap,
    gate: Gate,
) -> ApiResult<Session> {
    let wire = extract_wire_token(headers)
        .ok_or_else(|| ApiError::InvalidCredential("missing session token".to_string()))?;
    let token = SessionToken::decode(&wire, state.envelope())?;
    let entry = state
        .store()
        .entry(&token.session_id)
        .await?
        .ok_or_else(|| ApiError::InvalidCredential("session not found".to_string()))?;

    if !entry.token.is_valid_at(state.clock().now()) {
        debug!("session {} expired", token.session_id);
        state.store().remove(&token.session_id).await;
        return Err(ApiError::InvalidCredential("session expired".to_string()));
    }

    if gate == Gate::Totp && state.config().enable_totp() && !entry.totp.gate_cleared() {
        return Err(ApiError::InvalidCredential("TOTP required".to_string()));
    }

    Ok(Session {
        id: token.session_id,
        wire,
        token: entry.token,
        totp: entry.totp,
        is_sso: auth_cookie(headers).is_some_and(|cookie| cookie.is_sso),
    })
}

/// Headers handing the session to the client: the `yunion_auth` cookie and
/// the `X-Yunion-Auth` bearer header.
pub(super) fn session_headers(
    state: &AuthState,
    session_id: &str,
    token: &BackendToken,
    totp: &TotpState,
    is_sso: bool,
) -> ApiResult<HeaderMap> {
    let wire = SessionToken::from_state(session_id, totp).encode(state.envelope())?;
    let cookie = AuthCookie {
        exp: token.expires_at.to_rfc3339(),
        session: wire.clone(),
        totp_on: totp.verify_required,
        system_totp_on: state.config().enable_totp(),
        totp_verified: totp.verified,
        totp_init: totp.enabled,
        is_sso,
    }
    .encode()
    .map_err(ApiError::internal)?;

    let expires = (!state.config().session_level_auth_cookie()).then_some(token.expires_at);
    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        set_cookie(
            AUTH_COOKIE,
            &cookie,
            state.config().cookie_domain(),
            expires,
            state.clock().now(),
        )?,
    );
    headers.insert(AUTH_HEADER, bearer(&wire).map_err(ApiError::internal)?);
    Ok(headers)
}

pub(super) fn bearer(wire: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!("Bearer {wire}"))
}
