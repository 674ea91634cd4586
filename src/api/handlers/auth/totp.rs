//! Second-factor handlers: passcode check, enrollment, recovery questions.
//!
//! They run without the TOTP gate since they are how a pending session gets
//! through it.

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    session::{Session, session_headers},
    state::AuthState,
};
use crate::{
    error::{ApiError, ApiResult},
    identity::RecoveryQuestion,
    totp::TotpState,
};

#[derive(Debug, Deserialize)]
pub struct PasscodeRequest {
    #[serde(default)]
    passcode: String,
}

fn locked(seconds: u32) -> ApiError {
    ApiError::ResourceBusy(format!("locked, retry after {seconds} seconds"))
}

/// Check `passcode` against the session user's secret and record the outcome.
///
/// A locked session fails without consulting the secret. The lock is checked
/// again under the store's lock so concurrent attempts cannot slip past it.
pub(super) async fn verify_passcode(
    state: &AuthState,
    session: &Session,
    passcode: &str,
) -> ApiResult<TotpState> {
    let now = state.clock().unix();
    if let Some(seconds) = session.totp.locked_for(now) {
        return Err(locked(seconds));
    }
    if passcode.trim().is_empty() {
        return Err(ApiError::MissingParameter("missing passcode".to_string()));
    }

    let admin = state.admin_token()?;
    let valid = state
        .totp()
        .check(&admin, &session.token.user_id, passcode, u64::from(now))
        .await?;

    let outcome = state
        .store()
        .update_totp(&session.id, |totp| {
            if let Some(seconds) = totp.locked_for(now) {
                return Err(seconds);
            }
            if valid {
                totp.record_success();
            } else {
                totp.record_failure(now);
            }
            Ok(*totp)
        })
        .await?
        .ok_or_else(|| ApiError::InvalidCredential("session not found".to_string()))?;
    let totp = outcome.map_err(locked)?;

    if valid {
        info!("user {} passed TOTP", session.token.user);
        Ok(totp)
    } else {
        warn!(
            "user {} failed TOTP, {} consecutive failures",
            session.token.user, totp.retry_count
        );
        Err(ApiError::InputParameter("invalid passcode".to_string()))
    }
}

/// `POST /passcode`
pub async fn passcode(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
    Json(request): Json<PasscodeRequest>,
) -> ApiResult<Response> {
    let totp = verify_passcode(&state, &session, &request.passcode).await?;
    let headers = session_headers(&state, &session.id, &session.token, &totp, session.is_sso)?;
    Ok((StatusCode::OK, headers).into_response())
}

/// `POST /initcredential`: enroll the user if no secret exists yet.
pub async fn init_credential(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
) -> ApiResult<Json<Value>> {
    let admin = state.admin_token()?;
    let qrcode = state
        .totp()
        .initialize(&admin, &session.token.user_id, &session.token.user)
        .await?;
    if !qrcode.is_empty() {
        state
            .store()
            .update_totp(&session.id, |totp| totp.enabled = true)
            .await?;
    }
    Ok(Json(json!({"qrcode": qrcode})))
}

/// `GET /recovery`: questions only.
pub async fn recovery_questions(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
) -> ApiResult<Json<Value>> {
    let admin = state.admin_token()?;
    let questions = state
        .totp()
        .recovery_questions(&admin, &session.token.user_id)
        .await?;
    Ok(Json(json!({"questions": questions})))
}

/// `POST /recovery`: `[{"question": ..., "answer": ...}, ...]`
pub async fn save_recovery_questions(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
    Json(questions): Json<Vec<RecoveryQuestion>>,
) -> ApiResult<StatusCode> {
    let admin = state.admin_token()?;
    state
        .totp()
        .set_recovery_questions(&admin, &session.token.user_id, &questions)
        .await?;
    info!("user {} saved recovery questions", session.token.user);
    Ok(StatusCode::OK)
}

/// `POST /credential`: answer the recovery questions to get a fresh secret.
pub async fn reset_credential(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
    Json(answers): Json<Vec<RecoveryQuestion>>,
) -> ApiResult<Json<Value>> {
    let admin = state.admin_token()?;
    let qrcode = state
        .totp()
        .reset_with_recovery(&admin, &session.token.user_id, &session.token.user, &answers)
        .await?;
    state
        .store()
        .update_totp(&session.id, |totp| {
            totp.enabled = true;
            totp.verified = false;
        })
        .await?;
    info!("user {} reset the TOTP secret", session.token.user);
    Ok(Json(json!({"qrcode": qrcode})))
}
