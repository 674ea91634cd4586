//! External IDP login and account linking.
//!
//! `GET /idp/{idp_id}/redirect` parks the IDP id, driver, state and referer in
//! short-lived cookies and sends the browser to the IDP. The IDP posts back to
//! `/ssologin`, which either logs the user in or, when the redirect was started
//! with `linkuser`, links the external identity to the current user. Failures
//! end in a redirect to the referer carrying `result=error`.
//!
//! IDPs may also post unprompted to `/ssologin/{idp_id}`. No cookies exist for
//! such a response, so the driver comes from the backend and no state is
//! checked. `/idp/{idp_id}/saml-metadata` advertises that endpoint.

use axum::{
    Form, Json,
    extract::{Extension, Path, Query},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{LOCATION, REFERER, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use chrono::Duration;
use serde::Deserialize;
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, warn};

use super::{
    cookies::{clear_cookie, encode_value, read_encoded_cookie, set_cookie},
    login::{LoginBody, LoginOptions, establish, established_headers},
    middleware::AdminToken,
    session::{Gate, Session, resolve_session},
    state::AuthState,
    utils::{add_query, client_ip, header_str, random_state},
};
use crate::{
    error::{ApiError, ApiResult},
    identity::{IdentityError, IdpCallback, IdpDetails},
};

const IDP_ID_COOKIE: &str = "idp_id";
const IDP_DRIVER_COOKIE: &str = "idp_driver";
const IDP_STATE_COOKIE: &str = "idp_state";
const IDP_REFERER_COOKIE: &str = "idp_referer";
const IDP_LINK_USER_COOKIE: &str = "idp_link_user";
const IDP_COOKIES: [&str; 5] = [
    IDP_ID_COOKIE,
    IDP_DRIVER_COOKIE,
    IDP_STATE_COOKIE,
    IDP_REFERER_COOKIE,
    IDP_LINK_USER_COOKIE,
];
const IDP_COOKIE_SECONDS: i64 = 300;
const IDP_STATE_LENGTH: usize = 16;

/// Protocol parameters for `driver`, read through `get`.
pub(super) fn build_idp_callback(
    driver: &str,
    get: impl Fn(&str) -> Option<String>,
) -> ApiResult<IdpCallback> {
    let required = |key: &str| {
        get(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::MissingParameter(format!("missing {key}")))
    };
    match driver {
        "saml" => Ok(IdpCallback::Saml {
            response: required("SAMLResponse")?,
            relay_state: get("RelayState").unwrap_or_default(),
        }),
        "oidc" => Ok(IdpCallback::Oidc {
            code: required("code")?,
            state: get("state").unwrap_or_default(),
        }),
        "oauth2" => Ok(IdpCallback::OAuth2 {
            code: required("code")?,
            state: get("state").unwrap_or_default(),
        }),
        "cas" => Ok(IdpCallback::Cas {
            ticket: required("ticket")?,
        }),
        other => Err(ApiError::InputParameter(format!(
            "unsupported idp driver {other}"
        ))),
    }
}

pub async fn idp_redirect(
    headers: HeaderMap,
    Path(idp_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Extension(state): Extension<Arc<AuthState>>,
    Extension(AdminToken(admin)): Extension<AdminToken>,
) -> ApiResult<Response> {
    let link_user = if query.contains_key("linkuser") {
        let session = resolve_session(&state, &headers, Gate::Totp).await?;
        Some(session.token.user_id)
    } else {
        None
    };

    let idp_state = random_state(IDP_STATE_LENGTH);
    let redirect = state
        .backend()
        .idp_sso_redirect(&admin, &idp_id, &state.config().sso_callback_url(), &idp_state)
        .await?;
    let referer = header_str(&headers, &REFERER)
        .map_or_else(|| state.config().login_url().to_string(), str::to_string);

    let mut cookies = vec![
        (IDP_ID_COOKIE, idp_id),
        (IDP_DRIVER_COOKIE, redirect.driver),
        (IDP_STATE_COOKIE, idp_state),
        (IDP_REFERER_COOKIE, referer),
    ];
    if let Some(user_id) = link_user {
        cookies.push((IDP_LINK_USER_COOKIE, user_id));
    }

    let now = state.clock().now();
    let expires = Some(now + Duration::seconds(IDP_COOKIE_SECONDS));
    let mut response_headers = HeaderMap::new();
    for (name, value) in cookies {
        response_headers.append(
            SET_COOKIE,
            set_cookie(
                name,
                &encode_value(value.as_bytes()),
                state.config().cookie_domain(),
                expires,
                now,
            )?,
        );
    }
    response_headers.insert(
        LOCATION,
        HeaderValue::from_str(&redirect.uri).map_err(ApiError::internal)?,
    );
    Ok((StatusCode::FOUND, response_headers).into_response())
}

pub async fn sso_login_query(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    sso_login(&state, &headers, IdpCookies::read(&headers), &params).await
}

pub async fn sso_login_form(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    sso_login(&state, &headers, IdpCookies::read(&headers), &params).await
}

pub async fn idp_initiated_login_query(
    headers: HeaderMap,
    Path(idp_id): Path<String>,
    Extension(state): Extension<Arc<AuthState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    sso_login(&state, &headers, IdpCookies::unsolicited(idp_id), &params).await
}

pub async fn idp_initiated_login_form(
    headers: HeaderMap,
    Path(idp_id): Path<String>,
    Extension(state): Extension<Arc<AuthState>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    sso_login(&state, &headers, IdpCookies::unsolicited(idp_id), &params).await
}

/// `GET /idp/{idp_id}/info`
pub async fn idp_info(
    Path(idp_id): Path<String>,
    Extension(state): Extension<Arc<AuthState>>,
) -> ApiResult<Json<IdpDetails>> {
    let admin = state.admin_token()?;
    Ok(Json(state.backend().get_idp(&admin, &idp_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct MetadataQuery {
    #[serde(default)]
    pretty: bool,
}

/// `GET /idp/{idp_id}/saml-metadata`: service provider metadata to register
/// with a SAML IDP.
pub async fn idp_saml_metadata(
    Path(idp_id): Path<String>,
    Query(query): Query<MetadataQuery>,
    Extension(state): Extension<Arc<AuthState>>,
) -> ApiResult<Json<Value>> {
    let admin = state.admin_token()?;
    let idp = state.backend().get_idp(&admin, &idp_id).await?;
    if idp.driver != "saml" {
        return Err(ApiError::NotImplemented(format!(
            "idp {idp_id} uses {}, not saml",
            idp.driver
        )));
    }
    let metadata = state
        .backend()
        .idp_saml_metadata(
            &admin,
            &idp_id,
            &state.config().idp_initiated_callback_url(&idp_id),
            query.pretty,
        )
        .await?;
    Ok(Json(json!({ "metadata": metadata })))
}

#[derive(Debug, Default)]
struct IdpCookies {
    id: Option<String>,
    driver: Option<String>,
    state: Option<String>,
    referer: Option<String>,
    link_user: Option<String>,
    unsolicited: bool,
}

impl IdpCookies {
    fn read(headers: &HeaderMap) -> Self {
        Self {
            id: read_encoded_cookie(headers, IDP_ID_COOKIE),
            driver: read_encoded_cookie(headers, IDP_DRIVER_COOKIE),
            state: read_encoded_cookie(headers, IDP_STATE_COOKIE),
            referer: read_encoded_cookie(headers, IDP_REFERER_COOKIE),
            link_user: read_encoded_cookie(headers, IDP_LINK_USER_COOKIE),
            unsolicited: false,
        }
    }

    /// Context of a response the IDP sent without a gateway redirect. Any
    /// leftover redirect cookies are ignored.
    fn unsolicited(idp_id: String) -> Self {
        Self {
            id: Some(idp_id),
            unsolicited: true,
            ..Self::default()
        }
    }
}

enum SsoOutcome {
    LoggedIn(HeaderMap),
    Linked,
}

#[derive(Debug)]
struct SsoFailure {
    class: String,
    details: String,
    idp_id: Option<String>,
    idp_user_id: Option<String>,
}

impl From<ApiError> for SsoFailure {
    fn from(err: ApiError) -> Self {
        Self {
            class: err.class().to_string(),
            details: err.to_string(),
            idp_id: None,
            idp_user_id: None,
        }
    }
}

impl SsoFailure {
    fn from_identity(idp_id: &str, err: &IdentityError) -> Self {
        let not_found = err.is_user_not_found();
        Self {
            class: err.class().to_string(),
            details: err.details(),
            idp_id: not_found.then(|| idp_id.to_string()),
            idp_user_id: if not_found { err.idp_entity_id() } else { None },
        }
    }

    fn redirect_url(&self, referer: &str) -> String {
        let mut pairs = vec![
            ("result", "error"),
            ("error_class", self.class.as_str()),
            ("error_details", self.details.as_str()),
        ];
        if let Some(idp_id) = &self.idp_id {
            pairs.push(("idp_id", idp_id));
        }
        if let Some(user_id) = &self.idp_user_id {
            pairs.push(("idp_user_id", user_id));
        }
        add_query(referer, &pairs)
    }
}

async fn sso_login(
    state: &AuthState,
    headers: &HeaderMap,
    idp: IdpCookies,
    params: &HashMap<String, String>,
) -> Response {
    let referer = idp
        .referer
        .clone()
        .unwrap_or_else(|| state.config().login_url().to_string());

    let mut response_headers = HeaderMap::new();
    for name in IDP_COOKIES {
        if let Ok(cookie) = clear_cookie(name, state.config().cookie_domain()) {
            response_headers.append(SET_COOKIE, cookie);
        }
    }

    let target = match complete_sso(state, headers, &idp, params).await {
        Ok(SsoOutcome::LoggedIn(login_headers)) => {
            for (name, value) in &login_headers {
                response_headers.append(name.clone(), value.clone());
            }
            referer
        }
        Ok(SsoOutcome::Linked) => state.config().idp_link_success_url().to_string(),
        Err(failure) => {
            warn!("sso login failed: {}: {}", failure.class, failure.details);
            failure.redirect_url(&referer)
        }
    };

    match HeaderValue::from_str(&target) {
        Ok(location) => {
            response_headers.insert(LOCATION, location);
            (StatusCode::FOUND, response_headers).into_response()
        }
        Err(err) => {
            error!("invalid sso redirect target {target}: {err}");
            ApiError::InternalServer("invalid redirect".to_string()).into_response()
        }
    }
}

async fn complete_sso(
    state: &AuthState,
    headers: &HeaderMap,
    idp: &IdpCookies,
    params: &HashMap<String, String>,
) -> Result<SsoOutcome, SsoFailure> {
    let idp_id = idp
        .id
        .as_deref()
        .ok_or_else(|| ApiError::InputParameter("missing idp_id".to_string()))?;
    let driver = match (&idp.driver, idp.unsolicited) {
        (Some(driver), false) => driver.clone(),
        (_, true) => {
            let admin = state.admin_token()?;
            state
                .backend()
                .get_idp(&admin, idp_id)
                .await
                .map_err(ApiError::from)?
                .driver
        }
        (None, false) => {
            return Err(ApiError::InputParameter("missing idp_driver".to_string()).into());
        }
    };
    let callback = build_idp_callback(&driver, |key| params.get(key).cloned())?;
    if !idp.unsolicited
        && let Some(returned) = callback.state()
        && idp.state.as_deref() != Some(returned)
    {
        return Err(ApiError::InvalidCredential("idp state mismatch".to_string()).into());
    }
    let callback_url = if idp.unsolicited {
        state.config().idp_initiated_callback_url(idp_id)
    } else {
        state.config().sso_callback_url()
    };

    // a forged link cookie must not attach an identity to someone else
    let link_session: Option<Session> = match &idp.link_user {
        Some(user_id) => {
            let session = resolve_session(state, headers, Gate::Totp).await?;
            if &session.token.user_id != user_id {
                return Err(ApiError::Forbidden("link user mismatch".to_string()).into());
            }
            Some(session)
        }
        None => None,
    };

    let result = state
        .backend()
        .authenticate_idp(idp_id, &callback, &callback_url, &client_ip(headers))
        .await;

    match (result, link_session) {
        (Ok(token), None) => {
            info!("user {} logged in through idp {idp_id}", token.user);
            let mut body = LoginBody::new();
            let options = LoginOptions {
                project: None,
                mfa: true,
                is_sso: true,
            };
            let established = establish(state, token, &mut body, options).await?;
            Ok(SsoOutcome::LoggedIn(established_headers(
                state,
                &established,
                &body,
            )?))
        }
        (Ok(token), Some(session)) => {
            if token.user_id == session.token.user_id {
                Ok(SsoOutcome::Linked)
            } else {
                Err(ApiError::Conflict(
                    "identity already linked to another user".to_string(),
                )
                .into())
            }
        }
        (Err(err), Some(session)) if err.is_user_not_found() => {
            let entity = err.idp_entity_id().ok_or_else(|| {
                ApiError::InternalServer("idp did not report the external user".to_string())
            })?;
            let admin = state.admin_token()?;
            state
                .backend()
                .perform_user_action(
                    &admin,
                    &session.token.user_id,
                    "link-idp",
                    json!({"idp_id": idp_id, "idp_entity_id": entity}),
                )
                .await
                .map_err(ApiError::from)?;
            info!("user {} linked idp {idp_id}", session.token.user);
            Ok(SsoOutcome::Linked)
        }
        (Err(err), _) => Err(SsoFailure::from_identity(idp_id, &err)),
    }
}

/// `POST /unlink-idp` with `{"idp_id": ..., "idp_entity_id": ...}`.
pub async fn unlink_idp(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let admin = state.admin_token()?;
    let result = state
        .backend()
        .perform_user_action(&admin, &session.token.user_id, "unlink-idp", body)
        .await?;
    info!("user {} unlinked an external identity", session.token.user);
    Ok(Json(result))
}
