//! Identity backend collaborator.
//!
//! The gateway never stores identities itself: authentication, user lookup,
//! TOTP secrets, recovery questions and OIDC client credentials all live in the
//! identity backend. [`IdentityBackend`] is the seam; [`keystone::KeystoneClient`]
//! is the HTTP implementation used in production and tests substitute their own.

pub mod keystone;
pub mod token;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

pub use token::{BackendToken, RbacScope, ScopedPolicies, TokenRoleAssignment, TokenVersion};

#[derive(Debug, Error)]
pub enum IdentityError {
    /// JSON error document returned by the backend.
    #[error("{class}: {details}")]
    Remote {
        code: u16,
        class: String,
        details: String,
        data: Option<Value>,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("identity backend timeout")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl IdentityError {
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            Self::NotFound(_) => Some(404),
            _ => None,
        }
    }

    #[must_use]
    pub fn class(&self) -> &str {
        match self {
            Self::Remote { class, .. } => class,
            Self::NotFound(_) => "NotFoundError",
            Self::Timeout => "TimeoutError",
            Self::Transport(_) | Self::InvalidResponse(_) => "InternalServerError",
        }
    }

    #[must_use]
    pub fn details(&self) -> String {
        match self {
            Self::Remote { details, .. } => details.clone(),
            other => other.to_string(),
        }
    }

    /// The external user is unknown to the local directory.
    #[must_use]
    pub fn is_user_not_found(&self) -> bool {
        self.class() == "UserNotFoundError"
    }

    /// External identity carried by a `UserNotFoundError`, used to offer account linking.
    #[must_use]
    pub fn idp_entity_id(&self) -> Option<String> {
        let Self::Remote {
            data: Some(data), ..
        } = self
        else {
            return None;
        };
        ["idp_entity_id", "idp_user_id"]
            .iter()
            .find_map(|key| data.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    }
}

/// Protocol-specific parameters posted back by an external IDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdpCallback {
    Saml {
        response: String,
        relay_state: String,
    },
    Oidc {
        code: String,
        state: String,
    },
    OAuth2 {
        code: String,
        state: String,
    },
    Cas {
        ticket: String,
    },
}

impl IdpCallback {
    #[must_use]
    pub fn driver(&self) -> &'static str {
        match self {
            Self::Saml { .. } => "saml",
            Self::Oidc { .. } => "oidc",
            Self::OAuth2 { .. } => "oauth2",
            Self::Cas { .. } => "cas",
        }
    }

    /// State echoed by the IDP, if the protocol carries one.
    #[must_use]
    pub fn state(&self) -> Option<&str> {
        match self {
            Self::Saml { relay_state, .. } => Some(relay_state),
            Self::Oidc { state, .. } | Self::OAuth2 { state, .. } => Some(state),
            Self::Cas { .. } => None,
        }
    }
}

/// Service account used by the admin context.
#[derive(Clone)]
pub struct AdminCredentials {
    pub user: String,
    pub password: SecretString,
    pub domain: String,
    pub project: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("user", &self.user)
            .field("password", &"***")
            .field("domain", &self.domain)
            .field("project", &self.project)
            .finish()
    }
}

const fn default_true() -> bool {
    true
}

/// User record as returned by the backend. Unknown fields are kept in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserDetails {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub project_domain: String,
    #[serde(default)]
    pub enable_mfa: bool,
    #[serde(default = "default_true")]
    pub allow_web_console: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp_driver: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserDetails {
    /// Users federated from an external IDP cannot change their password here.
    #[must_use]
    pub fn is_idp_user(&self) -> bool {
        self.idp_driver.as_deref().is_some_and(|d| !d.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectDetails {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub project_domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleAssignment {
    pub role_id: String,
    pub role_name: String,
    pub project_id: String,
    pub project_name: String,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub domain_name: String,
}

/// Matched policy names keyed by scope (`system`, `domain`, `project`).
pub type MatchedPolicies = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryQuestion {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OidcClientCredential {
    pub redirect_uri: String,
    pub secret: String,
}

/// Public face of an identity provider. Driver configuration stays behind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdpDetails {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_uri: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdpRedirect {
    pub driver: String,
    pub uri: String,
}

/// Remote identity authority. Calls taking `admin` run with the admin context's
/// credential; the rest authenticate on behalf of the end user.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    async fn authenticate_web(
        &self,
        user: &str,
        password: &str,
        domain: Option<&str>,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError>;

    async fn authenticate_cas(
        &self,
        ticket: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError>;

    async fn authenticate_idp(
        &self,
        idp_id: &str,
        callback: &IdpCallback,
        redirect_uri: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError>;

    async fn authenticate_assume(
        &self,
        token: &str,
        user_id: &str,
        project_id: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError>;

    async fn authenticate_admin(
        &self,
        credentials: &AdminCredentials,
    ) -> Result<BackendToken, IdentityError>;

    async fn set_project(
        &self,
        project_id: &str,
        token: &BackendToken,
    ) -> Result<BackendToken, IdentityError>;

    async fn get_user(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<UserDetails, IdentityError>;

    async fn get_project(
        &self,
        admin: &BackendToken,
        project_id: &str,
    ) -> Result<ProjectDetails, IdentityError>;

    async fn get_user_projects(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<ProjectRef>, IdentityError>;

    async fn list_role_assignments(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<RoleAssignment>, IdentityError>;

    async fn fetch_matched_policies(
        &self,
        admin: &BackendToken,
        role_ids: &[String],
        project_id: &str,
        ip: &str,
    ) -> Result<MatchedPolicies, IdentityError>;

    async fn list_domains(
        &self,
        admin: &BackendToken,
        name: Option<&str>,
    ) -> Result<Vec<Value>, IdentityError>;

    async fn list_idps(
        &self,
        admin: &BackendToken,
        sso_domain: &str,
        auto_create_user: bool,
    ) -> Result<Vec<Value>, IdentityError>;

    async fn has_totp_secret(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<bool, IdentityError>;

    /// Ask the backend to mint a fresh secret; returns it base32-encoded.
    async fn create_totp_secret(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<String, IdentityError>;

    /// Current secret, base32-encoded.
    async fn totp_secret(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<String, IdentityError>;

    async fn remove_totp_secret(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<(), IdentityError>;

    async fn recovery_questions(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<RecoveryQuestion>, IdentityError>;

    async fn save_recovery_questions(
        &self,
        admin: &BackendToken,
        user_id: &str,
        questions: &[RecoveryQuestion],
    ) -> Result<(), IdentityError>;

    async fn oidc_credential(
        &self,
        admin: &BackendToken,
        client_id: &str,
    ) -> Result<OidcClientCredential, IdentityError>;

    async fn idp_sso_redirect(
        &self,
        admin: &BackendToken,
        idp_id: &str,
        callback_url: &str,
        state: &str,
    ) -> Result<IdpRedirect, IdentityError>;

    async fn get_idp(
        &self,
        admin: &BackendToken,
        idp_id: &str,
    ) -> Result<IdpDetails, IdentityError>;

    /// SAML service provider metadata whose assertion consumer is `redirect_uri`.
    async fn idp_saml_metadata(
        &self,
        admin: &BackendToken,
        idp_id: &str,
        redirect_uri: &str,
        pretty: bool,
    ) -> Result<String, IdentityError>;

    /// `POST users/<id>/<action>`, e.g. `link-idp` or `unlink-idp`.
    async fn perform_user_action(
        &self,
        admin: &BackendToken,
        user_id: &str,
        action: &str,
        body: Value,
    ) -> Result<Value, IdentityError>;

    async fn update_user_password(
        &self,
        admin: &BackendToken,
        user_id: &str,
        password: &str,
    ) -> Result<(), IdentityError>;
}
