//! `POST /api/v1/rpc/{module}/{id}/{action}`
//!
//! Small resource actions forwarded to the identity backend on behalf of the
//! session user. Handlers are looked up by `(module, action)`.

use async_trait::async_trait;
use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path},
};
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

use super::{session::Session, state::AuthState};
use crate::error::{ApiError, ApiResult};

#[async_trait]
pub trait RpcAction: Send + Sync {
    async fn call(
        &self,
        state: &AuthState,
        session: &Session,
        id: &str,
        body: Value,
    ) -> ApiResult<Value>;
}

#[derive(Default)]
pub struct RpcRegistry {
    actions: HashMap<(String, String), Arc<dyn RpcAction>>,
}

impl RpcRegistry {
    /// Registry with the built-in user and identity provider actions.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register("users", "unlink-idp", Arc::new(UnlinkIdp));
        registry.register("identity_providers", "sso-redirect-uri", Arc::new(SsoRedirectUri));
        registry
    }

    pub fn register(&mut self, module: &str, action: &str, handler: Arc<dyn RpcAction>) {
        self.actions
            .insert((module.to_string(), action.to_string()), handler);
    }

    fn get(&self, module: &str, action: &str) -> Option<Arc<dyn RpcAction>> {
        self.actions
            .get(&(module.to_string(), action.to_string()))
            .cloned()
    }
}

pub async fn dispatch(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(session): Extension<Session>,
    Path((module, id, action)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let handler = state
        .rpc()
        .get(&module, &action)
        .ok_or_else(|| ApiError::NotFound(format!("{module} {action} not found")))?;
    debug!("rpc {module}/{id}/{action}");
    let body = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::InputParameter(format!("invalid json body: {err}")))?
    };
    Ok(Json(handler.call(&state, &session, &id, body).await?))
}

/// Users may only unlink their own external identities.
struct UnlinkIdp;

#[async_trait]
impl RpcAction for UnlinkIdp {
    async fn call(
        &self,
        state: &AuthState,
        session: &Session,
        id: &str,
        body: Value,
    ) -> ApiResult<Value> {
        if id != session.token.user_id {
            return Err(ApiError::Forbidden("cannot unlink idp of other users".to_string()));
        }
        let admin = state.admin_token()?;
        let result = state
            .backend()
            .perform_user_action(&admin, id, "unlink-idp", body)
            .await?;
        info!("user {} unlinked an external identity", session.token.user);
        Ok(result)
    }
}

/// Callback URL to register with an external IDP.
struct SsoRedirectUri;

#[async_trait]
impl RpcAction for SsoRedirectUri {
    async fn call(
        &self,
        state: &AuthState,
        _session: &Session,
        _id: &str,
        _body: Value,
    ) -> ApiResult<Value> {
        Ok(json!({"redirect_uri": state.config().sso_callback_url()}))
    }
}
