//! HTTP implementation of [`IdentityBackend`] against a Keystone v3 style API.

use super::{
    AdminCredentials, BackendToken, IdentityBackend, IdentityError, IdpCallback, IdpDetails,
    IdpRedirect,
    MatchedPolicies, OidcClientCredential, ProjectDetails, ProjectRef, RecoveryQuestion,
    RoleAssignment, ScopedPolicies, TokenRoleAssignment, UserDetails,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const TOTP_CREDENTIAL: &str = "totp";
const RECOVERY_CREDENTIAL: &str = "recovery_secret";
const OIDC_CREDENTIAL: &str = "oidc";

#[derive(Debug, Clone)]
pub struct KeystoneClient {
    base: Url,
    client: Client,
}

impl KeystoneClient {
    /// Build a client for `auth_url` (e.g. `https://keystone:30500`).
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(auth_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = Url::parse(auth_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { base, client })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, IdentityError> {
        let url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|err| IdentityError::Transport(format!("{path}: {err}")))?;
        Ok(self.client.request(method, url))
    }

    fn admin_request(
        &self,
        method: Method,
        path: &str,
        admin: &BackendToken,
    ) -> Result<RequestBuilder, IdentityError> {
        Ok(self
            .request(method, path)?
            .header(AUTH_TOKEN_HEADER, &admin.id))
    }

    async fn authenticate(
        &self,
        body: Value,
        auth_token: Option<&str>,
    ) -> Result<BackendToken, IdentityError> {
        let mut request = self.request(Method::POST, "v3/auth/tokens")?.json(&body);
        if let Some(token) = auth_token {
            request = request.header(AUTH_TOKEN_HEADER, token);
        }
        let response = send(request).await?;
        let token_id = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| IdentityError::InvalidResponse("missing subject token".to_string()))?;
        let body: TokenEnvelope = parse(response).await?;
        Ok(body.token.into_backend_token(token_id))
    }

    async fn list_credentials(
        &self,
        admin: &BackendToken,
        user_id: &str,
        kind: &str,
    ) -> Result<Vec<Credential>, IdentityError> {
        let request = self
            .admin_request(Method::GET, "v3/credentials", admin)?
            .query(&[("user_id", user_id), ("type", kind), ("limit", "0")]);
        let list: CredentialList = parse(send(request).await?).await?;
        Ok(list.credentials)
    }

    async fn create_credential(
        &self,
        admin: &BackendToken,
        user_id: &str,
        kind: &str,
        blob: Option<String>,
    ) -> Result<Credential, IdentityError> {
        let mut credential = json!({"user_id": user_id, "type": kind});
        if let Some(blob) = blob {
            credential["blob"] = Value::String(blob);
        }
        let request = self
            .admin_request(Method::POST, "v3/credentials", admin)?
            .json(&json!({ "credential": credential }));
        let created: CredentialEnvelope = parse(send(request).await?).await?;
        Ok(created.credential)
    }

    async fn remove_credentials(
        &self,
        admin: &BackendToken,
        user_id: &str,
        kind: &str,
    ) -> Result<(), IdentityError> {
        for credential in self.list_credentials(admin, user_id, kind).await? {
            let path = format!("v3/credentials/{}", credential.id);
            send(self.admin_request(Method::DELETE, &path, admin)?).await?;
        }
        Ok(())
    }
}

async fn send(request: RequestBuilder) -> Result<Response, IdentityError> {
    let response = request.send().await.map_err(|err| {
        if err.is_timeout() {
            IdentityError::Timeout
        } else {
            IdentityError::Transport(err.to_string())
        }
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: Value = response.json().await.unwrap_or(Value::Null);
    debug!("identity backend returned {}: {}", status, body);

    let error = &body["error"];
    let code = error["code"]
        .as_u64()
        .and_then(|code| u16::try_from(code).ok())
        .unwrap_or_else(|| status.as_u16());
    let class = error["class"]
        .as_str()
        .map_or_else(|| class_for_status(code).to_string(), str::to_string);
    let details = error["details"]
        .as_str()
        .map_or_else(|| status.to_string(), str::to_string);
    let data = error.get("data").cloned().filter(|data| !data.is_null());

    if code == 404 && class == "NotFoundError" {
        return Err(IdentityError::NotFound(details));
    }

    Err(IdentityError::Remote {
        code,
        class,
        details,
        data,
    })
}

async fn parse<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, IdentityError> {
    response
        .json()
        .await
        .map_err(|err| IdentityError::InvalidResponse(err.to_string()))
}

fn class_for_status(code: u16) -> &'static str {
    match code {
        400 => "InputParameterError",
        401 => "InvalidCredentialError",
        403 => "ForbiddenError",
        404 => "NotFoundError",
        409 => "ConflictError",
        429 => "TooManyRequestsError",
        _ => "InternalServerError",
    }
}

fn callback_identity(idp_id: &str, callback: &IdpCallback, redirect_uri: &str) -> Value {
    let driver = callback.driver();
    let params = match callback {
        IdpCallback::Saml {
            response,
            relay_state,
        } => json!({"saml_response": response, "relay_state": relay_state}),
        IdpCallback::Oidc { code, state } | IdpCallback::OAuth2 { code, state } => {
            json!({"code": code, "state": state, "redirect_uri": redirect_uri})
        }
        IdpCallback::Cas { ticket } => json!({"ticket": ticket, "redirect_uri": redirect_uri}),
    };
    let mut identity = json!({ "methods": [driver], "id": idp_id });
    identity[driver] = params;
    identity
}

#[derive(Deserialize)]
struct TokenEnvelope {
    token: KeystoneToken,
}

#[derive(Deserialize, Default)]
struct NamedRef {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    domain: Option<Box<NamedRef>>,
}

#[derive(Deserialize, Default)]
struct CatalogEntry {
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize, Default)]
struct CatalogEndpoint {
    #[serde(default)]
    region_id: String,
}

#[derive(Deserialize)]
struct KeystoneToken {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    user: NamedRef,
    #[serde(default)]
    project: Option<NamedRef>,
    #[serde(default)]
    roles: Vec<NamedRef>,
    #[serde(default)]
    context: Option<TokenContext>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
    #[serde(default)]
    policies: ScopedPolicies,
    #[serde(default)]
    role_assignments: Vec<TokenRoleAssignment>,
}

#[derive(Deserialize, Default)]
struct TokenContext {
    #[serde(default)]
    ip: String,
}

impl KeystoneToken {
    fn into_backend_token(self, id: String) -> BackendToken {
        let (domain_id, domain) = self
            .user
            .domain
            .map(|d| (d.id, d.name))
            .unwrap_or_default();
        let project = self.project.unwrap_or_default();
        let (project_domain_id, project_domain) = project
            .domain
            .map(|d| (d.id, d.name))
            .unwrap_or_default();

        let mut regions: Vec<String> = Vec::new();
        for endpoint in self.catalog.iter().flat_map(|entry| &entry.endpoints) {
            if !endpoint.region_id.is_empty() && !regions.contains(&endpoint.region_id) {
                regions.push(endpoint.region_id.clone());
            }
        }

        BackendToken {
            id,
            expires_at: self.expires_at,
            user_id: self.user.id,
            user: self.user.name,
            domain_id,
            domain,
            project_id: project.id,
            project: project.name,
            project_domain_id,
            project_domain,
            role_ids: self.roles.iter().map(|r| r.id.clone()).collect(),
            roles: self.roles.into_iter().map(|r| r.name).collect(),
            login_ip: self.context.map(|c| c.ip).unwrap_or_default(),
            regions,
            policies: self.policies,
            role_assignments: self.role_assignments,
        }
    }
}

#[derive(Deserialize)]
struct CredentialList {
    #[serde(default)]
    credentials: Vec<Credential>,
}

#[derive(Deserialize)]
struct CredentialEnvelope {
    credential: Credential,
}

#[derive(Deserialize)]
struct Credential {
    #[serde(default)]
    id: String,
    #[serde(default)]
    blob: String,
}

#[derive(Deserialize)]
struct AssignmentList {
    #[serde(default)]
    role_assignments: Vec<KeystoneAssignment>,
}

#[derive(Deserialize)]
struct KeystoneAssignment {
    role: NamedRef,
    #[serde(default)]
    scope: AssignmentScope,
}

#[derive(Deserialize, Default)]
struct AssignmentScope {
    #[serde(default)]
    project: Option<NamedRef>,
}

#[async_trait]
impl IdentityBackend for KeystoneClient {
    #[instrument(skip(self, password))]
    async fn authenticate_web(
        &self,
        user: &str,
        password: &str,
        domain: Option<&str>,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError> {
        let mut user_ref = json!({"name": user, "password": password});
        if let Some(domain) = domain.filter(|d| !d.is_empty()) {
            user_ref["domain"] = json!({ "name": domain });
        }
        let body = json!({
            "auth": {
                "identity": {"methods": ["password"], "password": {"user": user_ref}},
                "context": {"source": "web", "ip": client_ip}
            }
        });
        self.authenticate(body, None).await
    }

    #[instrument(skip(self, ticket))]
    async fn authenticate_cas(
        &self,
        ticket: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError> {
        let body = json!({
            "auth": {
                "identity": {"methods": ["cas"], "cas": {"id": ticket}},
                "context": {"source": "web", "ip": client_ip}
            }
        });
        self.authenticate(body, None).await
    }

    #[instrument(skip(self, callback))]
    async fn authenticate_idp(
        &self,
        idp_id: &str,
        callback: &IdpCallback,
        redirect_uri: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError> {
        let body = json!({
            "auth": {
                "identity": callback_identity(idp_id, callback, redirect_uri),
                "context": {"source": "web", "ip": client_ip}
            }
        });
        self.authenticate(body, None).await
    }

    #[instrument(skip(self, token))]
    async fn authenticate_assume(
        &self,
        token: &str,
        user_id: &str,
        project_id: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError> {
        let body = json!({
            "auth": {
                "identity": {"methods": ["assume"], "assume": {"user": {"id": user_id}}},
                "scope": {"project": {"id": project_id}},
                "context": {"source": "web", "ip": client_ip}
            }
        });
        self.authenticate(body, Some(token)).await
    }

    #[instrument(skip(self))]
    async fn authenticate_admin(
        &self,
        credentials: &AdminCredentials,
    ) -> Result<BackendToken, IdentityError> {
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {"user": {
                        "name": credentials.user,
                        "password": credentials.password.expose_secret(),
                        "domain": {"name": credentials.domain}
                    }}
                },
                "scope": {"project": {
                    "name": credentials.project,
                    "domain": {"name": credentials.domain}
                }},
                "context": {"source": "srv"}
            }
        });
        self.authenticate(body, None).await
    }

    #[instrument(skip(self, token))]
    async fn set_project(
        &self,
        project_id: &str,
        token: &BackendToken,
    ) -> Result<BackendToken, IdentityError> {
        let body = json!({
            "auth": {
                "identity": {"methods": ["token"], "token": {"id": token.id}},
                "scope": {"project": {"id": project_id}},
                "context": {"source": "web", "ip": token.login_ip}
            }
        });
        self.authenticate(body, None).await
    }

    #[instrument(skip(self, admin))]
    async fn get_user(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<UserDetails, IdentityError> {
        let path = format!("v3/users/{user_id}");
        let body: Value = parse(send(self.admin_request(Method::GET, &path, admin)?).await?).await?;
        serde_json::from_value(body["user"].clone())
            .map_err(|err| IdentityError::InvalidResponse(err.to_string()))
    }

    #[instrument(skip(self, admin))]
    async fn get_project(
        &self,
        admin: &BackendToken,
        project_id: &str,
    ) -> Result<ProjectDetails, IdentityError> {
        let path = format!("v3/projects/{project_id}");
        let body: Value = parse(send(self.admin_request(Method::GET, &path, admin)?).await?).await?;
        serde_json::from_value(body["project"].clone())
            .map_err(|err| IdentityError::InvalidResponse(err.to_string()))
    }

    #[instrument(skip(self, admin))]
    async fn get_user_projects(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<ProjectRef>, IdentityError> {
        let path = format!("v3/users/{user_id}/projects");
        let body: Value = parse(send(self.admin_request(Method::GET, &path, admin)?).await?).await?;
        serde_json::from_value(body["projects"].clone())
            .map_err(|err| IdentityError::InvalidResponse(err.to_string()))
    }

    #[instrument(skip(self, admin))]
    async fn list_role_assignments(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<RoleAssignment>, IdentityError> {
        let request = self
            .admin_request(Method::GET, "v3/role_assignments", admin)?
            .query(&[
                ("user.id", user_id),
                ("effective", "true"),
                ("include_names", "true"),
                ("limit", "0"),
            ]);
        let list: AssignmentList = parse(send(request).await?).await?;
        Ok(list
            .role_assignments
            .into_iter()
            .filter_map(|assignment| {
                let project = assignment.scope.project?;
                let (domain_id, domain_name) = project
                    .domain
                    .map(|d| (d.id, d.name))
                    .unwrap_or_default();
                Some(RoleAssignment {
                    role_id: assignment.role.id,
                    role_name: assignment.role.name,
                    project_id: project.id,
                    project_name: project.name,
                    domain_id,
                    domain_name,
                })
            })
            .collect())
    }

    #[instrument(skip(self, admin))]
    async fn fetch_matched_policies(
        &self,
        admin: &BackendToken,
        role_ids: &[String],
        project_id: &str,
        ip: &str,
    ) -> Result<MatchedPolicies, IdentityError> {
        let mut query: Vec<(&str, &str)> = role_ids.iter().map(|id| ("role_ids", id.as_str())).collect();
        query.push(("project_id", project_id));
        query.push(("ip", ip));
        let request = self
            .admin_request(Method::GET, "v3/role_policies/matched-policies", admin)?
            .query(&query);
        let body: Value = parse(send(request).await?).await?;
        serde_json::from_value(body["policies"].clone())
            .map_err(|err| IdentityError::InvalidResponse(err.to_string()))
    }

    #[instrument(skip(self, admin))]
    async fn list_domains(
        &self,
        admin: &BackendToken,
        name: Option<&str>,
    ) -> Result<Vec<Value>, IdentityError> {
        let mut request = self
            .admin_request(Method::GET, "v3/domains", admin)?
            .query(&[("limit", "0")]);
        if let Some(name) = name {
            request = request.query(&[("name", name)]);
        }
        let body: Value = parse(send(request).await?).await?;
        Ok(body["domains"].as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self, admin))]
    async fn list_idps(
        &self,
        admin: &BackendToken,
        sso_domain: &str,
        auto_create_user: bool,
    ) -> Result<Vec<Value>, IdentityError> {
        let mut request = self
            .admin_request(Method::GET, "v3/identity_providers", admin)?
            .query(&[
                ("enabled", "true"),
                ("status", "connected"),
                ("sso", "true"),
                ("sso_domain", sso_domain),
                ("limit", "0"),
            ]);
        if auto_create_user {
            request = request.query(&[("auto_create_user", "true")]);
        }
        let body: Value = parse(send(request).await?).await?;
        Ok(body["identity_providers"]
            .as_array()
            .cloned()
            .unwrap_or_default())
    }

    #[instrument(skip(self, admin))]
    async fn has_totp_secret(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<bool, IdentityError> {
        Ok(!self
            .list_credentials(admin, user_id, TOTP_CREDENTIAL)
            .await?
            .is_empty())
    }

    #[instrument(skip(self, admin))]
    async fn create_totp_secret(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<String, IdentityError> {
        let credential = self
            .create_credential(admin, user_id, TOTP_CREDENTIAL, None)
            .await?;
        if credential.blob.is_empty() {
            return Err(IdentityError::InvalidResponse(
                "backend returned an empty totp secret".to_string(),
            ));
        }
        Ok(credential.blob)
    }

    #[instrument(skip(self, admin))]
    async fn totp_secret(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<String, IdentityError> {
        self.list_credentials(admin, user_id, TOTP_CREDENTIAL)
            .await?
            .into_iter()
            .next()
            .map(|credential| credential.blob)
            .ok_or_else(|| IdentityError::NotFound(format!("totp secret of user {user_id}")))
    }

    #[instrument(skip(self, admin))]
    async fn remove_totp_secret(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<(), IdentityError> {
        self.remove_credentials(admin, user_id, TOTP_CREDENTIAL)
            .await
    }

    #[instrument(skip(self, admin))]
    async fn recovery_questions(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<RecoveryQuestion>, IdentityError> {
        let credential = self
            .list_credentials(admin, user_id, RECOVERY_CREDENTIAL)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IdentityError::NotFound(format!("recovery questions of user {user_id}")))?;
        serde_json::from_str(&credential.blob)
            .map_err(|err| IdentityError::InvalidResponse(err.to_string()))
    }

    #[instrument(skip(self, admin, questions))]
    async fn save_recovery_questions(
        &self,
        admin: &BackendToken,
        user_id: &str,
        questions: &[RecoveryQuestion],
    ) -> Result<(), IdentityError> {
        let blob = serde_json::to_string(questions)
            .map_err(|err| IdentityError::InvalidResponse(err.to_string()))?;
        self.remove_credentials(admin, user_id, RECOVERY_CREDENTIAL)
            .await?;
        self.create_credential(admin, user_id, RECOVERY_CREDENTIAL, Some(blob))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, admin))]
    async fn oidc_credential(
        &self,
        admin: &BackendToken,
        client_id: &str,
    ) -> Result<OidcClientCredential, IdentityError> {
        let path = format!("v3/credentials/{client_id}");
        let envelope: CredentialEnvelope =
            parse(send(self.admin_request(Method::GET, &path, admin)?).await?).await?;
        let blob: Value = serde_json::from_str(&envelope.credential.blob)
            .map_err(|err| IdentityError::InvalidResponse(err.to_string()))?;
        if blob.get("type").and_then(Value::as_str).is_some_and(|t| t != OIDC_CREDENTIAL) {
            return Err(IdentityError::NotFound(format!("oidc client {client_id}")));
        }
        serde_json::from_value(blob).map_err(|err| IdentityError::InvalidResponse(err.to_string()))
    }

    #[instrument(skip(self, admin))]
    async fn idp_sso_redirect(
        &self,
        admin: &BackendToken,
        idp_id: &str,
        callback_url: &str,
        state: &str,
    ) -> Result<IdpRedirect, IdentityError> {
        let path = format!("v3/identity_providers/{idp_id}/sso-redirect-uri");
        let request = self
            .admin_request(Method::GET, &path, admin)?
            .query(&[("redirect_uri", callback_url), ("state", state)]);
        parse(send(request).await?).await
    }

    #[instrument(skip(self, admin))]
    async fn get_idp(
        &self,
        admin: &BackendToken,
        idp_id: &str,
    ) -> Result<IdpDetails, IdentityError> {
        let path = format!("v3/identity_providers/{idp_id}");
        let body: Value = parse(send(self.admin_request(Method::GET, &path, admin)?).await?).await?;
        serde_json::from_value(body["identity_provider"].clone())
            .map_err(|err| IdentityError::InvalidResponse(err.to_string()))
    }

    #[instrument(skip(self, admin))]
    async fn idp_saml_metadata(
        &self,
        admin: &BackendToken,
        idp_id: &str,
        redirect_uri: &str,
        pretty: bool,
    ) -> Result<String, IdentityError> {
        let path = format!("v3/identity_providers/{idp_id}/saml-metadata");
        let mut request = self
            .admin_request(Method::GET, &path, admin)?
            .query(&[("redirect_uri", redirect_uri)]);
        if pretty {
            request = request.query(&[("pretty", "true")]);
        }
        let body: Value = parse(send(request).await?).await?;
        body["metadata"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| IdentityError::InvalidResponse("saml metadata missing".to_string()))
    }

    #[instrument(skip(self, admin, body))]
    async fn perform_user_action(
        &self,
        admin: &BackendToken,
        user_id: &str,
        action: &str,
        body: Value,
    ) -> Result<Value, IdentityError> {
        let path = format!("v3/users/{user_id}/{action}");
        let request = self
            .admin_request(Method::POST, &path, admin)?
            .json(&json!({ "user": body }));
        parse(send(request).await?).await
    }

    #[instrument(skip(self, admin, password))]
    async fn update_user_password(
        &self,
        admin: &BackendToken,
        user_id: &str,
        password: &str,
    ) -> Result<(), IdentityError> {
        let path = format!("v3/users/{user_id}");
        let request = self
            .admin_request(Method::PATCH, &path, admin)?
            .json(&json!({"user": {"password": password}}));
        send(request).await?;
        Ok(())
    }
}
