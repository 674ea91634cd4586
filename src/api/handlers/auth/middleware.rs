//! Route-layer guards for the three handler families.

use axum::{
    extract::{Extension, Request},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::{
    session::{AUTH_HEADER, Gate, bearer, resolve_session},
    state::AuthState,
};
use crate::{error::ApiResult, identity::BackendToken};

/// Admin credential attached to requests of the session-less family.
#[derive(Debug, Clone)]
pub struct AdminToken(pub Arc<BackendToken>);

/// Marker a handler puts on its response once it has ended the session, so the
/// token is not echoed back.
#[derive(Debug, Clone, Copy)]
pub(super) struct SessionClosed;

/// Full session: valid token and a cleared second factor.
pub async fn require_session(
    Extension(state): Extension<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    authenticate(&state, request, next, Gate::Totp).await
}

/// Session whose second factor may still be pending.
pub async fn require_session_no_totp(
    Extension(state): Extension<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    authenticate(&state, request, next, Gate::SkipTotp).await
}

async fn authenticate(
    state: &AuthState,
    mut request: Request,
    next: Next,
    gate: Gate,
) -> ApiResult<Response> {
    let session = resolve_session(state, request.headers(), gate).await?;
    let wire = session.wire.clone();
    request.extensions_mut().insert(session);

    let mut response = next.run(request).await;
    if response.extensions().get::<SessionClosed>().is_none()
        && !response.headers().contains_key(AUTH_HEADER)
    {
        if let Ok(value) = bearer(&wire) {
            response.headers_mut().insert(AUTH_HEADER, value);
        }
    }
    Ok(response)
}

/// No user session; the handler acts with the admin credential.
pub async fn require_admin(
    Extension(state): Extension<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> ApiResult<Response> {
    let token = state.admin_token()?;
    request.extensions_mut().insert(AdminToken(token));
    Ok(next.run(request).await)
}
