//! OIDC provider endpoints under `/api/v1/auth/oidc`.
//!
//! Authorization codes and access tokens are self-contained: both carry a
//! sealed [`ClientInfo`], so nothing about a relying party's login is stored.

use axum::{
    Form, Json,
    extract::{Extension, OriginalUri, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header::LOCATION},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::{net::Ipv4Addr, sync::Arc};
use tracing::{debug, info, warn};

use super::{
    middleware::AdminToken,
    regions::current_region,
    session::{Gate, Session, resolve_session},
    state::AuthState,
    user::{end_session, user_info as session_user_info},
    utils::{add_query, client_ip, extract_basic_auth, extract_bearer_token, no_cache_headers},
};
use crate::{
    error::{ApiError, ApiResult},
    identity::BackendToken,
    oidc::{
        self, ACCESS_TOKEN_LIFETIME_SECONDS, CODE_LIFETIME_SECONDS, ClientInfo, IdTokenClaims,
        Jwks, sign_id_token,
    },
};

const AUTHORIZATION_CODE: &str = "authorization_code";

fn redirect(target: &str) -> ApiResult<Response> {
    let mut headers = HeaderMap::new();
    no_cache_headers(&mut headers);
    headers.insert(
        LOCATION,
        HeaderValue::from_str(target).map_err(ApiError::internal)?,
    );
    Ok((StatusCode::FOUND, headers).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeQuery {
    #[serde(default)]
    response_type: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    redirect_uri: String,
    #[serde(default)]
    state: String,
}

/// `GET /oidc/auth`
///
/// Without a session the browser is sent to the login page, which comes back
/// here afterwards. Client and redirect URI are checked before anything is
/// sent to the redirect URI.
pub async fn authorize(
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<AuthorizeQuery>,
    Extension(state): Extension<Arc<AuthState>>,
) -> ApiResult<Response> {
    let Ok(session) = resolve_session(&state, &headers, Gate::Totp).await else {
        let config = state.config();
        let back = format!("{}{uri}", config.api_server());
        return redirect(&add_query(
            config.login_url(),
            &[(config.login_callback_param(), &back)],
        ));
    };

    let admin = state.admin_token()?;
    let credential = state
        .backend()
        .oidc_credential(&admin, &query.client_id)
        .await
        .map_err(|err| {
            debug!("oidc client {} lookup failed: {err}", query.client_id);
            ApiError::InvalidCredential(format!("invalid client_id {}", query.client_id))
        })?;
    if query.redirect_uri.is_empty() || credential.redirect_uri != query.redirect_uri {
        return Err(ApiError::InvalidCredential("redirect_uri mismatch".to_string()));
    }

    match issue_code(&state, &headers, &session, &query) {
        Ok(code) => {
            let mut pairs = vec![("code", code.as_str())];
            if !query.state.is_empty() {
                pairs.push(("state", query.state.as_str()));
            }
            info!(
                "issued oidc code for user {} to client {}",
                session.token.user, query.client_id
            );
            redirect(&add_query(&query.redirect_uri, &pairs))
        }
        Err(err) => {
            let description = err.to_string();
            let mut pairs = vec![
                ("error", err.class()),
                ("error_description", description.as_str()),
            ];
            if !query.state.is_empty() {
                pairs.push(("state", query.state.as_str()));
            }
            redirect(&add_query(&query.redirect_uri, &pairs))
        }
    }
}

fn issue_code(
    state: &AuthState,
    headers: &HeaderMap,
    session: &Session,
    query: &AuthorizeQuery,
) -> ApiResult<String> {
    if query.response_type != "code" {
        return Err(ApiError::InputParameter(format!(
            "unsupported response_type {}",
            query.response_type
        )));
    }
    let ip = client_ip(headers)
        .parse::<Ipv4Addr>()
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    let info = ClientInfo::issue(
        state.clock().now(),
        ip,
        &session.token.user_id,
        &session.token.project_id,
        &current_region(state, headers),
    );
    Ok(info.encode_code(state.envelope())?)
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    grant_type: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    redirect_uri: String,
}

/// `POST /oidc/token`: exchange a code, authenticated with HTTP Basic.
///
/// Every rejection is `InvalidCredential`.
pub async fn token(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    Extension(AdminToken(admin)): Extension<AdminToken>,
    Form(request): Form<TokenRequest>,
) -> ApiResult<Json<Value>> {
    if request.grant_type != AUTHORIZATION_CODE {
        return Err(ApiError::InvalidCredential(format!(
            "invalid grant type {}",
            request.grant_type
        )));
    }
    let info = ClientInfo::decode_code(&request.code, state.envelope())
        .map_err(|_| ApiError::InvalidCredential("invalid code".to_string()))?;
    let now = state.clock().now();
    if info.is_expired(now, CODE_LIFETIME_SECONDS) {
        return Err(ApiError::InvalidCredential("code expires".to_string()));
    }

    let (client_id, client_secret) = extract_basic_auth(&headers)?;
    let credential = state
        .backend()
        .oidc_credential(&admin, &client_id)
        .await
        .map_err(|_| ApiError::InvalidCredential(format!("invalid client_id {client_id}")))?;
    if credential.redirect_uri != request.redirect_uri {
        return Err(ApiError::InvalidCredential("redirect_uri mismatch".to_string()));
    }
    if credential.secret != client_secret {
        return Err(ApiError::InvalidCredential("client secret mismatch".to_string()));
    }

    // the access token restarts the clock for its own, longer lifetime
    let access = ClientInfo::issue(
        now,
        info.client_ip,
        &info.user_id,
        &info.project_id,
        &info.region,
    );
    let access_token = access.encode_access_token(state.envelope())?;

    let id_token = match state.envelope().private_key() {
        Some(key) => {
            let claims = IdTokenClaims {
                iss: state.config().api_server().to_string(),
                sub: info.user_id.clone(),
                aud: client_id.clone(),
                exp: now.timestamp() + ACCESS_TOKEN_LIFETIME_SECONDS,
                iat: now.timestamp(),
            };
            sign_id_token(key, &claims)?
        }
        None => {
            warn!("no RSA key configured, id_token left empty");
            String::new()
        }
    };
    info!("oidc client {client_id} redeemed a code for user {}", info.user_id);

    Ok(Json(json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": ACCESS_TOKEN_LIFETIME_SECONDS,
        "id_token": id_token,
    })))
}

/// `GET /oidc/user`: profile of the access token's user.
pub async fn user_info(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    Extension(AdminToken(admin)): Extension<AdminToken>,
) -> ApiResult<Json<Map<String, Value>>> {
    let bearer = extract_bearer_token(&headers)
        .ok_or_else(|| ApiError::InvalidCredential("No token in header".to_string()))?;
    let info = ClientInfo::decode_access_token(&bearer, state.envelope())
        .map_err(|_| ApiError::InvalidCredential("Token in header invalid".to_string()))?;
    if info.is_expired(state.clock().now(), ACCESS_TOKEN_LIFETIME_SECONDS) {
        return Err(ApiError::InvalidCredential("Token expired".to_string()));
    }

    let token = BackendToken {
        user_id: info.user_id.clone(),
        project_id: info.project_id.clone(),
        login_ip: info.client_ip.to_string(),
        ..BackendToken::default()
    };
    let data = session_user_info(&state, &admin, &token)
        .await
        .map_err(|err| ApiError::NotFound(format!("user {}: {err}", info.user_id)))?;
    Ok(Json(data))
}

/// `GET /oidc/.well-known/openid-configuration`
pub async fn configuration(
    Extension(state): Extension<Arc<AuthState>>,
) -> Json<oidc::DiscoveryDocument> {
    Json(oidc::discovery(state.config().api_server()))
}

/// `GET /oidc/keys`
pub async fn keys(Extension(state): Extension<Arc<AuthState>>) -> ApiResult<Json<Jwks>> {
    let public_key = state
        .envelope()
        .public_key()
        .ok_or_else(|| ApiError::NotImplemented("no signing key configured".to_string()))?;
    Ok(Json(Jwks::from_public_key(public_key)))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    post_logout_redirect_uri: String,
    #[serde(default)]
    state: String,
}

pub async fn logout_query(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    Query(request): Query<LogoutRequest>,
) -> ApiResult<Response> {
    logout(&state, &headers, &request).await
}

pub async fn logout_form(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    Form(request): Form<LogoutRequest>,
) -> ApiResult<Response> {
    logout(&state, &headers, &request).await
}

/// End the gateway session, then go to the relying party's landing page or
/// the login page.
async fn logout(
    state: &AuthState,
    headers: &HeaderMap,
    request: &LogoutRequest,
) -> ApiResult<Response> {
    let cleared = end_session(state, headers).await;
    let target = if request.post_logout_redirect_uri.is_empty() {
        state.config().login_url().to_string()
    } else if request.state.is_empty() {
        request.post_logout_redirect_uri.clone()
    } else {
        add_query(
            &request.post_logout_redirect_uri,
            &[("state", request.state.as_str())],
        )
    };
    let mut response = redirect(&target)?;
    for (name, value) in &cleared {
        response.headers_mut().append(name.clone(), value.clone());
    }
    Ok(response)
}
