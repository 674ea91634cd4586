//! `POST /api/v1/auth/login`
//!
//! Every login flavour (password, CAS ticket, external IDP, assume token and
//! the in-session project switch) ends in the same pipeline: pick a project,
//! check the user may use the web console, decide whether a second factor is
//! required, store the session and hand the cookies back.

use axum::{
    Json,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{
    assume::{self, ASSUME_HEADER},
    cookies::set_cookie,
    session::{Gate, resolve_session, session_headers},
    sso::build_idp_callback,
    state::AuthState,
    utils::{client_ip, decode_password, header_str},
};
use crate::{
    error::{ApiError, ApiResult},
    identity::{BackendToken, IdentityError, IdpCallback, RbacScope},
    totp::TotpState,
};

/// Request body; unknown keys are kept and some of them (`isadmin`, `scope`,
/// `domain`) are echoed as cookies.
pub(super) type LoginBody = Map<String, Value>;

enum Credential {
    Password {
        user: String,
        password: String,
        domain: Option<String>,
    },
    Cas {
        ticket: String,
    },
    Idp {
        idp_id: String,
        callback: IdpCallback,
    },
}

#[derive(Debug, Default)]
pub(super) struct LoginOptions {
    /// Project requested by the client, by id or name.
    pub project: Option<String>,
    /// Whether the second factor may be demanded of this login.
    pub mfa: bool,
    pub is_sso: bool,
}

/// A freshly stored session.
#[derive(Debug)]
pub(super) struct Established {
    pub session_id: String,
    pub token: BackendToken,
    pub totp: TotpState,
    /// Enrollment QR code when the user had to be enrolled on the spot.
    pub qrcode: String,
    pub is_sso: bool,
}

pub async fn login(
    headers: HeaderMap,
    Extension(state): Extension<Arc<AuthState>>,
    body: Bytes,
) -> ApiResult<Response> {
    let mut body = parse_body(&body)?;
    let client_ip = client_ip(&headers);

    if let Some(assume_token) = header_str(&headers, &ASSUME_HEADER) {
        let token = assume::authenticate(&state, assume_token, &client_ip).await?;
        let established = establish(&state, token, &mut body, LoginOptions::default()).await?;
        return login_response(&state, &established, &body);
    }

    if body.contains_key("tenantId") {
        return switch_project(&state, &headers, &body).await;
    }

    let (credential, project) = credential(&body)?;
    let is_sso = matches!(credential, Credential::Idp { .. });
    let token = authenticate(&state, &credential, &client_ip)
        .await
        .map_err(normalize_login_error)?;
    info!("user {} logged in from {}", token.user, client_ip);

    let options = LoginOptions {
        project,
        mfa: true,
        is_sso,
    };
    let established = establish(&state, token, &mut body, options).await?;
    login_response(&state, &established, &body)
}

fn parse_body(body: &Bytes) -> ApiResult<LoginBody> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(LoginBody::new());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::InputParameter(format!("invalid login body: {err}")))
}

fn body_str<'a>(body: &'a LoginBody, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// String or boolean field, as a string.
fn requested(body: &LoginBody, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(value) if !value.is_empty() => Some(value.clone()),
        Value::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}

/// `<project>/<user>` selects a project at login time.
fn split_login_user(user: &str) -> (Option<&str>, &str) {
    match user.split_once('/') {
        Some((project, name)) if !project.is_empty() && !name.is_empty() => (Some(project), name),
        _ => (None, user),
    }
}

fn credential(body: &LoginBody) -> ApiResult<(Credential, Option<String>)> {
    let project = body_str(body, "tenant").map(str::to_string);

    if let Some(ticket) = body_str(body, "cas_ticket") {
        return Ok((
            Credential::Cas {
                ticket: ticket.to_string(),
            },
            project,
        ));
    }

    if let (Some(idp_id), Some(driver)) = (body_str(body, "idp_id"), body_str(body, "idp_driver")) {
        let callback = build_idp_callback(driver, |key| body_str(body, key).map(str::to_string))?;
        return Ok((
            Credential::Idp {
                idp_id: idp_id.to_string(),
                callback,
            },
            project,
        ));
    }

    let user = body_str(body, "username")
        .ok_or_else(|| ApiError::InputParameter("missing username".to_string()))?;
    let password = body_str(body, "password")
        .ok_or_else(|| ApiError::InputParameter("missing password".to_string()))?;
    let (prefix, user) = split_login_user(user);
    Ok((
        Credential::Password {
            user: user.to_string(),
            password: password.to_string(),
            domain: body_str(body, "domain").map(str::to_string),
        },
        prefix.map(str::to_string).or(project),
    ))
}

async fn authenticate(
    state: &AuthState,
    credential: &Credential,
    client_ip: &str,
) -> Result<BackendToken, IdentityError> {
    let backend = state.backend();
    match credential {
        Credential::Password {
            user,
            password,
            domain,
        } => {
            let password = decode_password(state.config().password_key(), password);
            backend
                .authenticate_web(user, &password, domain.as_deref(), client_ip)
                .await
        }
        Credential::Cas { ticket } => backend.authenticate_cas(ticket, client_ip).await,
        Credential::Idp { idp_id, callback } => {
            backend
                .authenticate_idp(idp_id, callback, &state.config().sso_callback_url(), client_ip)
                .await
        }
    }
}

/// Backend failures a user may see verbatim; the rest collapse into one message.
pub(super) fn normalize_login_error(err: IdentityError) -> ApiError {
    if let IdentityError::Remote { code, class, .. } = &err {
        if *code >= 500 || *code == 409 || *code == 429 {
            return err.into();
        }
        let details = match class.as_str() {
            "UserLockedError" => Some("The user has been locked, please contact the administrator"),
            "UserDisabledError" => {
                Some("The user has been disabled, please contact the administrator")
            }
            "InvalidIdpStatus" => Some("The identity provider of the user is disabled or invalid"),
            _ => None,
        };
        if let Some(details) = details {
            return ApiError::Remote {
                code: *code,
                class: class.clone(),
                details: details.to_string(),
            };
        }
    }
    debug!("login rejected: {err}");
    ApiError::InvalidCredential("username/password incorrect".to_string())
}

/// Run the post-authentication pipeline and store the session.
pub(super) async fn establish(
    state: &AuthState,
    token: BackendToken,
    body: &mut LoginBody,
    options: LoginOptions,
) -> ApiResult<Established> {
    let admin = state.admin_token()?;
    let token = select_project(state, &admin, token, options.project.as_deref(), body).await;

    let user = state.backend().get_user(&admin, &token.user_id).await?;
    if !user.allow_web_console {
        warn!("user {} is not allowed to use the web console", user.name);
        return Err(ApiError::Forbidden("user forbidden login from web".to_string()));
    }

    let enrolled = state.backend().has_totp_secret(&admin, &token.user_id).await?;
    let verify_required = options.mfa && state.config().enable_totp() && user.enable_mfa;
    let mut totp = TotpState::new(enrolled, verify_required);

    let qrcode = if verify_required && !enrolled {
        let qrcode = state
            .totp()
            .initialize(&admin, &token.user_id, &user.name)
            .await?;
        totp.enabled = !qrcode.is_empty();
        qrcode
    } else {
        String::new()
    };

    let session_id = state.store().save(token.clone(), totp).await;
    debug!("stored session for user {}", token.user);
    Ok(Established {
        session_id,
        token,
        totp,
        qrcode,
        is_sso: options.is_sso,
    })
}

/// Give the token a project: the requested one, else the highest-scoped role
/// assignment, else a project named after the user, else the first project.
/// Failures leave the token unscoped.
async fn select_project(
    state: &AuthState,
    admin: &BackendToken,
    mut token: BackendToken,
    requested: Option<&str>,
    body: &mut LoginBody,
) -> BackendToken {
    let backend = state.backend();

    if let Some(project) = requested {
        match backend.get_project(admin, project).await {
            Ok(details) => match backend.set_project(&details.id, &token).await {
                Ok(scoped) => token = scoped,
                Err(err) => warn!("switch to requested project {project} failed: {err}"),
            },
            Err(err) => warn!("requested project {project} not found: {err}"),
        }
    }
    if !token.project_id.is_empty() {
        return token;
    }

    let mut best: Option<(String, RbacScope)> = None;
    for assignment in &token.role_assignments {
        let level = assignment.policies.level();
        if best.as_ref().is_none_or(|(_, current)| level > *current) {
            best = Some((assignment.project_id.clone(), level));
        }
    }
    if let Some((project_id, level)) = best {
        match backend.set_project(&project_id, &token).await {
            Ok(scoped) => {
                token = scoped;
                body.entry("scope")
                    .or_insert_with(|| Value::String(level.as_str().to_string()));
                return token;
            }
            Err(err) => warn!("switch to assigned project {project_id} failed: {err}"),
        }
    }

    match backend.get_user_projects(admin, &token.user_id).await {
        Ok(projects) => {
            let pick = projects
                .iter()
                .find(|p| p.name == token.user)
                .or_else(|| projects.first());
            if let Some(project) = pick {
                match backend.set_project(&project.id, &token).await {
                    Ok(scoped) => token = scoped,
                    Err(err) => warn!("switch to project {} failed: {err}", project.id),
                }
            }
        }
        Err(err) => error!("list projects of user {} failed: {err}", token.user_id),
    }
    token
}

/// Session cookie and header, plus the project helper cookies.
pub(super) fn established_headers(
    state: &AuthState,
    established: &Established,
    body: &LoginBody,
) -> ApiResult<HeaderMap> {
    let mut headers = session_headers(
        state,
        &established.session_id,
        &established.token,
        &established.totp,
        established.is_sso,
    )?;
    project_cookies(state, &mut headers, &established.token, body)?;
    Ok(headers)
}

pub(super) fn login_response(
    state: &AuthState,
    established: &Established,
    body: &LoginBody,
) -> ApiResult<Response> {
    let headers = established_headers(state, established, body)?;
    if established.qrcode.is_empty() {
        Ok((StatusCode::OK, headers).into_response())
    } else {
        Ok((
            StatusCode::OK,
            headers,
            Json(json!({"qrcode": established.qrcode})),
        )
            .into_response())
    }
}

/// `isadmin`, `scope` and `domain` only when requested, clamped to what the
/// token may do; `tenant` whenever the token is scoped.
fn project_cookies(
    state: &AuthState,
    headers: &mut HeaderMap,
    token: &BackendToken,
    body: &LoginBody,
) -> ApiResult<()> {
    if token.project_id.is_empty() {
        return Ok(());
    }
    let mut cookies = Vec::new();
    if let Some(isadmin) = requested(body, "isadmin") {
        let value = if token.is_scope_capable(RbacScope::System) {
            isadmin
        } else {
            "false".to_string()
        };
        cookies.push(("isadmin", value));
    }
    if let Some(scope) = requested(body, "scope") {
        let capable = scope
            .parse::<RbacScope>()
            .is_ok_and(|scope| token.is_scope_capable(scope));
        let value = if capable {
            scope
        } else {
            RbacScope::Project.as_str().to_string()
        };
        cookies.push(("scope", value));
    }
    if let Some(domain) = requested(body, "domain") {
        cookies.push(("domain", domain));
    }
    cookies.push(("tenant", token.project_id.clone()));

    let now = state.clock().now();
    for (name, value) in cookies {
        headers.append(
            SET_COOKIE,
            set_cookie(name, &value, None, Some(token.expires_at), now)?,
        );
    }
    Ok(())
}

/// `{"tenantId": ...}`: rescope the current session, keeping its id and TOTP state.
async fn switch_project(
    state: &AuthState,
    headers: &HeaderMap,
    body: &LoginBody,
) -> ApiResult<Response> {
    let tenant = body_str(body, "tenantId")
        .ok_or_else(|| ApiError::InputParameter("missing tenantId".to_string()))?;
    let session = resolve_session(state, headers, Gate::SkipTotp).await?;
    if !session.totp.gate_cleared() {
        return Err(ApiError::InvalidCredential(
            "TOTP authentication failed".to_string(),
        ));
    }

    let token = state
        .backend()
        .set_project(tenant, &session.token)
        .await
        .map_err(|err| {
            warn!("switch to project {tenant} failed: {err}");
            ApiError::InvalidCredential("failed to change project".to_string())
        })?;

    let admin = state.admin_token()?;
    let user = state.backend().get_user(&admin, &token.user_id).await?;
    if !user.allow_web_console {
        return Err(ApiError::Forbidden("user forbidden login from web".to_string()));
    }

    if !state.store().replace_token(&session.id, token.clone()).await? {
        return Err(ApiError::InvalidCredential("session not found".to_string()));
    }
    info!("user {} switched to project {}", token.user, token.project);

    let established = Established {
        session_id: session.id,
        token,
        totp: session.totp,
        qrcode: String::new(),
        is_sso: session.is_sso,
    };
    login_response(state, &established, body)
}
