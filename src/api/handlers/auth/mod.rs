//! Auth handlers and supporting modules.
//!
//! Routes fall into three families, each behind its own route layer:
//!
//! - **Session**: `/user`, `/unlink-idp`, the IDP info and metadata reads and
//!   the RPC actions need a valid session whose second factor is cleared.
//! - **Session, TOTP pending**: `/passcode`, `/initcredential`, `/credential`,
//!   `/recovery` and `/password` need a session but run before the TOTP gate.
//! - **Admin**: `/regions`, the SSO callbacks and most OIDC endpoints need no
//!   session; they act with the admin credential and fail while it is missing.
//!
//! `/login`, `/logout`, `/assume` and `/oidc/auth` resolve sessions themselves.
//!
//! ## Session transport
//!
//! After login the session id is wrapped in a compact token and sent both in
//! the `yunion_auth` cookie and in the `X-Yunion-Auth` header. Guarded
//! responses echo the header back so non-browser clients can keep it current.

mod assume;
mod cookies;
mod login;
mod middleware;
mod oidc;
mod password;
mod regions;
mod rpc;
mod session;
mod sso;
mod state;
mod totp;
mod user;
mod utils;

use axum::{
    Router,
    middleware::from_fn,
    routing::{get, post},
};

pub use cookies::{AUTH_COOKIE, AuthCookie};
pub use middleware::AdminToken;
pub use rpc::{RpcAction, RpcRegistry};
pub use session::{AUTH_HEADER, Session};
pub use state::{AuthConfig, AuthState, Clock};

/// Routes mounted under `/api/v1/auth`.
pub fn router() -> Router {
    let session = Router::new()
        .route("/user", get(user::user))
        .route("/unlink-idp", post(sso::unlink_idp))
        .route("/idp/{idp_id}/info", get(sso::idp_info))
        .route("/idp/{idp_id}/saml-metadata", get(sso::idp_saml_metadata))
        .route_layer(from_fn(middleware::require_session));

    let pending = Router::new()
        .route("/passcode", post(totp::passcode))
        .route("/initcredential", post(totp::init_credential))
        .route("/credential", post(totp::reset_credential))
        .route(
            "/recovery",
            get(totp::recovery_questions).post(totp::save_recovery_questions),
        )
        .route("/password", post(password::change_password))
        .route_layer(from_fn(middleware::require_session_no_totp));

    let admin = Router::new()
        .route("/regions", get(regions::regions))
        .route("/idp/{idp_id}/redirect", get(sso::idp_redirect))
        .route(
            "/ssologin",
            get(sso::sso_login_query).post(sso::sso_login_form),
        )
        .route(
            "/ssologin/{idp_id}",
            get(sso::idp_initiated_login_query).post(sso::idp_initiated_login_form),
        )
        .route("/oidc/token", post(oidc::token))
        .route("/oidc/user", get(oidc::user_info))
        .route(
            "/oidc/.well-known/openid-configuration",
            get(oidc::configuration),
        )
        .route("/oidc/keys", get(oidc::keys))
        .route(
            "/oidc/logout",
            get(oidc::logout_query).post(oidc::logout_form),
        )
        .route_layer(from_fn(middleware::require_admin));

    Router::new()
        .route("/login", post(login::login))
        .route("/logout", get(user::logout).post(user::logout))
        .route("/assume", get(assume::assume))
        .route("/oidc/auth", get(oidc::authorize))
        .merge(session)
        .merge(pending)
        .merge(admin)
}

/// Routes mounted under `/api/v1/rpc`.
pub fn rpc_router() -> Router {
    Router::new()
        .route("/{module}/{id}/{action}", post(rpc::dispatch))
        .route_layer(from_fn(middleware::require_session))
}
