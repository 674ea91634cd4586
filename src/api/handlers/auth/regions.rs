//! `GET /regions`: what the login page needs before anyone is logged in.

use axum::{
    Json,
    extract::{Extension, Query},
    http::HeaderMap,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

use super::{cookies::read_cookie, middleware::AdminToken, state::AuthState};
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct RegionsQuery {
    /// SSO domain the IDP list is filtered by.
    #[serde(default = "all_domains")]
    domain: String,
    #[serde(default)]
    auto_create_user: bool,
}

fn all_domains() -> String {
    "all".to_string()
}

pub async fn regions(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(AdminToken(admin)): Extension<AdminToken>,
    Query(query): Query<RegionsQuery>,
) -> ApiResult<Json<Value>> {
    let regions = state.admin().regions();
    if regions.is_empty() {
        return Err(ApiError::InternalServer("region is empty".to_string()));
    }

    let domains: Vec<String> = if state.config().return_full_domain_list() {
        state
            .backend()
            .list_domains(&admin, None)
            .await?
            .iter()
            .filter(|domain| domain.get("enabled").and_then(Value::as_bool).unwrap_or(true))
            .filter_map(|domain| domain.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let idps = state
        .backend()
        .list_idps(&admin, &query.domain, query.auto_create_user)
        .await
        .unwrap_or_else(|err| {
            warn!("list idps failed: {err}");
            Vec::new()
        });

    Ok(Json(json!({
        "regions": regions,
        "domains": domains,
        "return_full_domains": state.config().return_full_domain_list(),
        "idps": idps,
        "encrypt_passwd": true,
        "api_server": state.config().api_server(),
    })))
}

/// Region for requests that need one: the `region` cookie, the configured
/// default, or the first region of the admin credential.
pub(super) fn current_region(state: &AuthState, headers: &HeaderMap) -> String {
    read_cookie(headers, "region")
        .filter(|region| !region.is_empty())
        .or_else(|| state.config().default_region().map(str::to_string))
        .or_else(|| state.admin().regions().into_iter().next())
        .unwrap_or_default()
}
