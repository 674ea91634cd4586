//! `GET /user` and logout.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    cookies::{AUTH_COOKIE, clear_cookie},
    middleware::SessionClosed,
    session::{Session, extract_wire_token},
    state::AuthState,
    utils::no_cache_headers,
};
use crate::{
    error::ApiResult,
    identity::{BackendToken, ProjectDetails, RbacScope},
    session::SessionToken,
};

/// User fields copied verbatim from the backend record.
const USER_FIELDS: &[&str] = &[
    "displayname",
    "email",
    "id",
    "name",
    "enabled",
    "mobile",
    "allow_web_console",
    "created_at",
    "enable_mfa",
    "is_system_account",
    "last_active_at",
    "last_login_ip",
    "last_login_source",
    "password_expires_at",
    "failed_auth_count",
    "failed_auth_at",
    "need_reset_password",
    "password_reset_hint",
    "idps",
    "is_local",
];

pub async fn user(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
) -> ApiResult<Json<Value>> {
    let admin = state.admin_token()?;
    let data = user_info(&state, &admin, &session.token).await?;
    Ok(Json(json!({"data": data})))
}

struct ProjectRoles {
    id: String,
    name: String,
    domain_id: String,
    domain: String,
    roles: Vec<(String, String)>,
}

/// Profile of the token's user as the console sees it: identity, current
/// project, every project with its roles and matched policies, and the flags
/// the front-end needs.
pub(super) async fn user_info(
    state: &AuthState,
    admin: &BackendToken,
    token: &BackendToken,
) -> ApiResult<Map<String, Value>> {
    let backend = state.backend();
    let user = backend.get_user(admin, &token.user_id).await?;
    let record = serde_json::to_value(&user).unwrap_or_default();

    let mut info = Map::new();
    for field in USER_FIELDS {
        if let Some(value) = record.get(*field) {
            info.insert((*field).to_string(), value.clone());
        }
    }
    info.insert(
        "domain".to_string(),
        json!({"id": user.domain_id, "name": user.project_domain}),
    );
    info.insert("regions".to_string(), json!(state.admin().regions()));
    info.insert(
        "system_totp_on".to_string(),
        Value::Bool(state.config().enable_totp()),
    );

    if !token.project_id.is_empty() {
        let project = backend
            .get_project(admin, &token.project_id)
            .await
            .unwrap_or_else(|err| {
                warn!("project {} lookup failed: {err}", token.project_id);
                ProjectDetails {
                    id: token.project_id.clone(),
                    name: token.project.clone(),
                    domain_id: token.project_domain_id.clone(),
                    project_domain: token.project_domain.clone(),
                    metadata: None,
                }
            });
        info.insert("projectId".to_string(), json!(project.id));
        info.insert("projectName".to_string(), json!(project.name));
        info.insert("projectDomainId".to_string(), json!(project.domain_id));
        info.insert("projectDomain".to_string(), json!(project.project_domain));
        info.insert(
            "project_meta".to_string(),
            project.metadata.unwrap_or_else(|| json!({})),
        );
    }
    info.insert("roles".to_string(), json!(token.roles.join(",")));

    let assignments = backend.list_role_assignments(admin, &token.user_id).await?;
    let mut grouped: Vec<ProjectRoles> = Vec::new();
    for assignment in assignments {
        let role = (assignment.role_id, assignment.role_name);
        if let Some(project) = grouped.iter_mut().find(|p| p.id == assignment.project_id) {
            project.roles.push(role);
        } else {
            grouped.push(ProjectRoles {
                id: assignment.project_id,
                name: assignment.project_name,
                domain_id: assignment.domain_id,
                domain: assignment.domain_name,
                roles: vec![role],
            });
        }
    }

    let mut projects = Vec::with_capacity(grouped.len());
    for project in grouped {
        let role_ids: Vec<String> = project.roles.iter().map(|(id, _)| id.clone()).collect();
        let policies = backend
            .fetch_matched_policies(admin, &role_ids, &project.id, &token.login_ip)
            .await
            .unwrap_or_else(|err| {
                warn!("matched policies of project {} failed: {err}", project.id);
                Default::default()
            });

        let mut entry = Map::new();
        entry.insert("id".to_string(), json!(project.id));
        entry.insert("name".to_string(), json!(project.name));
        entry.insert("domain_id".to_string(), json!(project.domain_id));
        entry.insert("domain".to_string(), json!(project.domain));
        entry.insert(
            "roles".to_string(),
            Value::Array(
                project
                    .roles
                    .iter()
                    .map(|(id, name)| json!({"id": id, "name": name}))
                    .collect(),
            ),
        );
        for scope in [RbacScope::Project, RbacScope::Domain, RbacScope::System] {
            let matched = policies.get(scope.as_str()).cloned().unwrap_or_default();
            entry.insert(format!("{scope}_capable"), Value::Bool(!matched.is_empty()));
            entry.insert(format!("{scope}_policies"), json!(matched));
        }
        let admin_capable = policies
            .get(RbacScope::System.as_str())
            .is_some_and(|p| !p.is_empty());
        entry.insert("admin_capable".to_string(), Value::Bool(admin_capable));
        projects.push(Value::Object(entry));
    }
    info.insert("projects".to_string(), Value::Array(projects));

    let scoped = &token.policies;
    info.insert("system_policies".to_string(), json!(scoped.system));
    info.insert("domain_policies".to_string(), json!(scoped.domain));
    info.insert("project_policies".to_string(), json!(scoped.project));
    info.insert("admin_policies".to_string(), json!(scoped.system));
    info.insert("policies".to_string(), json!(scoped.project));
    info.insert(
        "non_default_domain_projects".to_string(),
        Value::Bool(state.config().non_default_domain_projects()),
    );
    info.insert(
        "enable_quota_check".to_string(),
        Value::Bool(state.config().enable_quota_check()),
    );
    Ok(info)
}

/// `GET|POST /logout`: drop the session if there is one and clear the cookie.
pub async fn logout(headers: HeaderMap, Extension(state): Extension<Arc<AuthState>>) -> Response {
    let mut response_headers = end_session(&state, &headers).await;
    no_cache_headers(&mut response_headers);
    (StatusCode::OK, response_headers).into_response()
}

/// Remove the caller's session; returns headers clearing the auth cookie.
pub(super) async fn end_session(state: &AuthState, headers: &HeaderMap) -> HeaderMap {
    if let Some(wire) = extract_wire_token(headers) {
        if let Ok(token) = SessionToken::decode(&wire, state.envelope()) {
            if let Ok(Some(entry)) = state.store().entry(&token.session_id).await {
                info!("user {} logged out", entry.token.user);
            }
            state.store().remove(&token.session_id).await;
        }
    }
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_cookie(AUTH_COOKIE, state.config().cookie_domain()) {
        response_headers.append(SET_COOKIE, cookie);
    }
    response_headers
}

/// Response for handlers that end the session they were called with.
pub(super) fn closed(headers: HeaderMap) -> Response {
    let mut response = (StatusCode::OK, headers).into_response();
    response.extensions_mut().insert(SessionClosed);
    response
}
