//! `POST /password`: change the session user's password and end the session.

use axum::{Json, extract::Extension, http::HeaderMap, response::Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{
    session::Session,
    state::AuthState,
    totp::verify_passcode,
    user::{closed, end_session},
    utils::{client_ip, decode_password, no_cache_headers},
};
use crate::{
    error::{ApiError, ApiResult},
    identity::IdentityError,
};

#[derive(Debug, Deserialize)]
pub struct PasswordChange {
    #[serde(default)]
    password_old: String,
    #[serde(default)]
    password_new: String,
    #[serde(default)]
    password_confirm: String,
    #[serde(default)]
    passcode: String,
}

pub async fn change_password(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
    Json(request): Json<PasswordChange>,
) -> ApiResult<Response> {
    let new_password = decode_password(state.config().password_key(), &request.password_new);
    if new_password.is_empty() {
        return Err(ApiError::MissingParameter("missing new password".to_string()));
    }
    if new_password != decode_password(state.config().password_key(), &request.password_confirm) {
        return Err(ApiError::InputParameter("new password mismatch".to_string()));
    }

    let admin = state.admin_token()?;
    let user = state
        .backend()
        .get_user(&admin, &session.token.user_id)
        .await?;
    if user.is_idp_user() {
        return Err(ApiError::Forbidden(
            "cannot change password of an external identity".to_string(),
        ));
    }

    state
        .backend()
        .authenticate_web(
            &session.token.user,
            &decode_password(state.config().password_key(), &request.password_old),
            Some(session.token.domain.as_str()).filter(|d| !d.is_empty()),
            &client_ip(&headers),
        )
        .await
        .map_err(|err| match err {
            IdentityError::Remote { code: 409, .. } => err.into(),
            _ => ApiError::InputParameter("wrong password".to_string()),
        })?;

    if user.enable_mfa && state.config().enable_totp() {
        verify_passcode(&state, &session, &request.passcode).await?;
    }

    state
        .backend()
        .update_user_password(&admin, &session.token.user_id, &new_password)
        .await?;
    info!("user {} changed the password", session.token.user);

    let mut response_headers = end_session(&state, &headers).await;
    no_cache_headers(&mut response_headers);
    Ok(closed(response_headers))
}
