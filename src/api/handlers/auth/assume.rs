//! Assume login: a trusted service vouches for `<token>:<user_id>:<project_id>`
//! through the `X-Assume-Token` header.

use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::{LOCATION, SET_COOKIE}},
    response::{IntoResponse, Response},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::info;

use super::{
    cookies::{check_cookie, is_reserved, set_cookie},
    login::{LoginBody, LoginOptions, establish, established_headers, normalize_login_error},
    state::AuthState,
    utils::{client_ip, header_str},
};
use crate::{
    error::{ApiError, ApiResult},
    identity::BackendToken,
};

pub const ASSUME_HEADER: HeaderName = HeaderName::from_static("x-assume-token");

fn parse_assume_token(value: &str) -> ApiResult<(&str, &str, &str)> {
    let mut parts = value.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(token), Some(user_id), Some(project_id), None)
            if !token.is_empty() && !user_id.is_empty() && !project_id.is_empty() =>
        {
            Ok((token, user_id, project_id))
        }
        _ => Err(ApiError::InputParameter(
            "invalid assume token, expect <token>:<user_id>:<project_id>".to_string(),
        )),
    }
}

pub(super) async fn authenticate(
    state: &AuthState,
    header: &str,
    client_ip: &str,
) -> ApiResult<BackendToken> {
    let (token, user_id, project_id) = parse_assume_token(header)?;
    let token = state
        .backend()
        .authenticate_assume(token, user_id, project_id, client_ip)
        .await
        .map_err(normalize_login_error)?;
    info!("user {} assumed into project {}", token.user, token.project);
    Ok(token)
}

/// Only same-site relative paths are followed.
fn redirect_target(target: Option<&str>) -> &str {
    match target {
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path,
        _ => "/",
    }
}

/// `GET /assume?p=<path>&<cookie>=<value>...`
///
/// Logs in with the assume header, sets the remaining query parameters as
/// plain cookies and redirects to `p`. Parameters naming a login cookie or
/// carrying characters a cookie cannot hold are rejected before logging in.
pub async fn assume(
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
    Extension(state): Extension<Arc<AuthState>>,
) -> ApiResult<Response> {
    let header = header_str(&headers, &ASSUME_HEADER)
        .ok_or_else(|| ApiError::MissingParameter("missing X-Assume-Token header".to_string()))?;
    for (name, value) in params.iter().filter(|(name, _)| name.as_str() != "p") {
        if is_reserved(name) {
            return Err(ApiError::InputParameter(format!("cookie {name} cannot be set")));
        }
        check_cookie(name, value)?;
    }
    let token = authenticate(&state, header, &client_ip(&headers)).await?;

    let mut body = LoginBody::new();
    let established = establish(&state, token, &mut body, LoginOptions::default()).await?;
    let mut response_headers = established_headers(&state, &established, &body)?;

    let now = state.clock().now();
    for (name, value) in params.iter().filter(|(name, _)| name.as_str() != "p") {
        let cookie = set_cookie(name, value, None, Some(established.token.expires_at), now)?;
        response_headers.append(SET_COOKIE, cookie);
    }

    let target = redirect_target(params.get("p").map(String::as_str));
    response_headers.insert(
        LOCATION,
        HeaderValue::from_str(target).map_err(ApiError::internal)?,
    );
    Ok((StatusCode::FOUND, response_headers).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assume_token_has_three_parts() {
        assert_eq!(
            parse_assume_token("t:u:p").ok(),
            Some(("t", "u", "p"))
        );
        assert!(parse_assume_token("t:u").is_err());
        assert!(parse_assume_token("t:u:p:x").is_err());
        assert!(parse_assume_token("t::p").is_err());
    }

    #[test]
    fn redirect_stays_on_site() {
        assert_eq!(redirect_target(Some("/dashboard")), "/dashboard");
        assert_eq!(redirect_target(Some("//evil.example")), "/");
        assert_eq!(redirect_target(Some("https://evil.example")), "/");
        assert_eq!(redirect_target(None), "/");
    }
}
