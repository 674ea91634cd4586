//! In-process identity backend for unit and handler tests.

use crate::identity::{
    AdminCredentials, BackendToken, IdentityBackend, IdentityError, IdpCallback, IdpDetails,
    IdpRedirect,
    MatchedPolicies, OidcClientCredential, ProjectDetails, ProjectRef, RecoveryQuestion,
    RoleAssignment, ScopedPolicies, UserDetails,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

pub const ALICE_ID: &str = "alice-id";
pub const ALICE_PASSWORD: &str = "p";
pub const TOTP_SECRET: &str = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";

#[derive(Clone)]
struct MockUser {
    details: UserDetails,
    password: String,
    projects: Vec<ProjectRef>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, MockUser>,
    totp_secrets: HashMap<String, String>,
    recovery: HashMap<String, Vec<RecoveryQuestion>>,
    oidc_clients: HashMap<String, OidcClientCredential>,
    idp_links: HashMap<String, String>,
    actions: Vec<String>,
    passwords_set: Vec<(String, String)>,
    locked_users: Vec<String>,
}

pub struct MockBackend {
    inner: Mutex<Inner>,
    tokens_issued: AtomicUsize,
    admin_attempts: AtomicUsize,
    admin_failures_left: AtomicUsize,
}

impl MockBackend {
    /// Directory with `alice` (password `p`) owning projects `alice` (proj-A)
    /// and `beta` (proj-B).
    pub fn new() -> Self {
        let backend = Self {
            inner: Mutex::new(Inner::default()),
            tokens_issued: AtomicUsize::new(0),
            admin_attempts: AtomicUsize::new(0),
            admin_failures_left: AtomicUsize::new(0),
        };
        backend.add_user(
            ALICE_ID,
            "alice",
            ALICE_PASSWORD,
            &[("proj-A", "alice"), ("proj-B", "beta")],
        );
        backend
    }

    pub fn add_user(&self, id: &str, name: &str, password: &str, projects: &[(&str, &str)]) {
        let user = MockUser {
            details: UserDetails {
                id: id.to_string(),
                name: name.to_string(),
                domain_id: "default".to_string(),
                project_domain: "Default".to_string(),
                allow_web_console: true,
                extra: serde_json::from_value(json!({"displayname": name, "enabled": true}))
                    .unwrap_or_default(),
                ..UserDetails::default()
            },
            password: password.to_string(),
            projects: projects
                .iter()
                .map(|(id, name)| ProjectRef {
                    id: (*id).to_string(),
                    name: (*name).to_string(),
                })
                .collect(),
        };
        self.lock().users.insert(id.to_string(), user);
    }

    pub fn enable_mfa(&self, user_id: &str) {
        let mut inner = self.lock();
        if let Some(user) = inner.users.get_mut(user_id) {
            user.details.enable_mfa = true;
        }
        inner
            .totp_secrets
            .insert(user_id.to_string(), TOTP_SECRET.to_string());
    }

    pub fn deny_web_console(&self, user_id: &str) {
        if let Some(user) = self.lock().users.get_mut(user_id) {
            user.details.allow_web_console = false;
        }
    }

    pub fn set_idp_driver(&self, user_id: &str, driver: &str) {
        if let Some(user) = self.lock().users.get_mut(user_id) {
            user.details.idp_driver = Some(driver.to_string());
        }
    }

    /// Responses from `idp_id` naming `entity` log in as `user_id`.
    pub fn link_idp(&self, idp_id: &str, entity: &str, user_id: &str) {
        self.lock()
            .idp_links
            .insert(format!("{idp_id}/{entity}"), user_id.to_string());
    }

    /// Password logins for `user_id` fail with a 409 `UserLockedError`.
    pub fn lock_user(&self, user_id: &str) {
        self.lock().locked_users.push(user_id.to_string());
    }

    pub fn add_oidc_client(&self, client_id: &str, redirect_uri: &str, secret: &str) {
        self.lock().oidc_clients.insert(
            client_id.to_string(),
            OidcClientCredential {
                redirect_uri: redirect_uri.to_string(),
                secret: secret.to_string(),
            },
        );
    }

    pub fn set_recovery_questions(&self, user_id: &str, questions: &[(&str, &str)]) {
        self.lock().recovery.insert(
            user_id.to_string(),
            questions
                .iter()
                .map(|(q, a)| RecoveryQuestion {
                    question: (*q).to_string(),
                    answer: (*a).to_string(),
                })
                .collect(),
        );
    }

    pub fn fail_admin_auth(&self, times: usize) {
        self.admin_failures_left.store(times, Ordering::SeqCst);
    }

    pub fn admin_auth_attempts(&self) -> usize {
        self.admin_attempts.load(Ordering::SeqCst)
    }

    /// `users/<id>/<action>` calls observed so far.
    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    pub fn passwords_set(&self) -> Vec<(String, String)> {
        self.lock().passwords_set.clone()
    }

    pub fn totp_secret_of(&self, user_id: &str) -> Option<String> {
        self.lock().totp_secrets.get(user_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn user(&self, user_id: &str) -> Result<MockUser, IdentityError> {
        self.lock()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("user {user_id}")))
    }

    fn user_by_name(&self, name: &str) -> Option<MockUser> {
        self.lock()
            .users
            .values()
            .find(|u| u.details.name == name)
            .cloned()
    }

    fn issue(&self, user: &MockUser, project: Option<&ProjectRef>, client_ip: &str) -> BackendToken {
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst);
        BackendToken {
            id: format!("tok-{n}"),
            expires_at: Utc::now() + Duration::hours(1),
            user_id: user.details.id.clone(),
            user: user.details.name.clone(),
            domain_id: "default".to_string(),
            domain: "Default".to_string(),
            project_id: project.map(|p| p.id.clone()).unwrap_or_default(),
            project: project.map(|p| p.name.clone()).unwrap_or_default(),
            project_domain_id: project.map(|_| "default".to_string()).unwrap_or_default(),
            project_domain: project.map(|_| "Default".to_string()).unwrap_or_default(),
            roles: project.map(|_| vec!["member".to_string()]).unwrap_or_default(),
            role_ids: project.map(|_| vec!["role-member".to_string()]).unwrap_or_default(),
            login_ip: client_ip.to_string(),
            regions: vec!["region0".to_string()],
            policies: ScopedPolicies {
                project: project.map(|_| vec!["project-member".to_string()]).unwrap_or_default(),
                ..ScopedPolicies::default()
            },
            role_assignments: Vec::new(),
        }
    }

    fn invalid_credential() -> IdentityError {
        IdentityError::Remote {
            code: 401,
            class: "InvalidCredentialError".to_string(),
            details: "invalid credential".to_string(),
            data: None,
        }
    }
}

#[async_trait]
impl IdentityBackend for MockBackend {
    async fn authenticate_web(
        &self,
        user: &str,
        password: &str,
        _domain: Option<&str>,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError> {
        let found = self
            .user_by_name(user)
            .ok_or_else(Self::invalid_credential)?;
        if self.lock().locked_users.contains(&found.details.id) {
            return Err(IdentityError::Remote {
                code: 409,
                class: "UserLockedError".to_string(),
                details: "user locked".to_string(),
                data: None,
            });
        }
        if found.password != password {
            return Err(Self::invalid_credential());
        }
        Ok(self.issue(&found, None, client_ip))
    }

    async fn authenticate_cas(
        &self,
        ticket: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError> {
        let name = ticket.strip_prefix("ST-").ok_or_else(Self::invalid_credential)?;
        let user = self.user_by_name(name).ok_or_else(Self::invalid_credential)?;
        Ok(self.issue(&user, None, client_ip))
    }

    /// The SAML response / code / ticket is taken to be the external entity id.
    async fn authenticate_idp(
        &self,
        idp_id: &str,
        callback: &IdpCallback,
        _redirect_uri: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError> {
        let entity = match callback {
            IdpCallback::Saml { response, .. } => response,
            IdpCallback::Oidc { code, .. } | IdpCallback::OAuth2 { code, .. } => code,
            IdpCallback::Cas { ticket } => ticket,
        };
        let linked = self.lock().idp_links.get(&format!("{idp_id}/{entity}")).cloned();
        let Some(user_id) = linked else {
            return Err(IdentityError::Remote {
                code: 404,
                class: "UserNotFoundError".to_string(),
                details: format!("user {entity} not found"),
                data: Some(json!({"idp_id": idp_id, "idp_entity_id": entity})),
            });
        };
        let user = self.user(&user_id)?;
        Ok(self.issue(&user, None, client_ip))
    }

    async fn authenticate_assume(
        &self,
        token: &str,
        user_id: &str,
        project_id: &str,
        client_ip: &str,
    ) -> Result<BackendToken, IdentityError> {
        if token != "trusted" {
            return Err(Self::invalid_credential());
        }
        let user = self.user(user_id)?;
        let project = user
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("project {project_id}")))?;
        Ok(self.issue(&user, Some(&project), client_ip))
    }

    async fn authenticate_admin(
        &self,
        credentials: &AdminCredentials,
    ) -> Result<BackendToken, IdentityError> {
        self.admin_attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.admin_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.admin_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(IdentityError::Transport("connection refused".to_string()));
        }
        let admin = MockUser {
            details: UserDetails {
                id: "sysadmin-id".to_string(),
                name: credentials.user.clone(),
                ..UserDetails::default()
            },
            password: credentials.password.expose_secret().to_string(),
            projects: Vec::new(),
        };
        let project = ProjectRef {
            id: "system-id".to_string(),
            name: credentials.project.clone(),
        };
        let mut token = self.issue(&admin, Some(&project), "127.0.0.1");
        token.policies.system = vec!["sysadmin".to_string()];
        Ok(token)
    }

    async fn set_project(
        &self,
        project_id: &str,
        token: &BackendToken,
    ) -> Result<BackendToken, IdentityError> {
        let user = self.user(&token.user_id)?;
        let project = user
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .cloned()
            .ok_or_else(Self::invalid_credential)?;
        Ok(self.issue(&user, Some(&project), &token.login_ip))
    }

    async fn get_user(
        &self,
        _admin: &BackendToken,
        user_id: &str,
    ) -> Result<UserDetails, IdentityError> {
        Ok(self.user(user_id)?.details)
    }

    async fn get_project(
        &self,
        _admin: &BackendToken,
        project_id: &str,
    ) -> Result<ProjectDetails, IdentityError> {
        let inner = self.lock();
        inner
            .users
            .values()
            .flat_map(|u| u.projects.iter())
            .find(|p| p.id == project_id)
            .map(|p| ProjectDetails {
                id: p.id.clone(),
                name: p.name.clone(),
                domain_id: "default".to_string(),
                project_domain: "Default".to_string(),
                metadata: None,
            })
            .ok_or_else(|| IdentityError::NotFound(format!("project {project_id}")))
    }

    async fn get_user_projects(
        &self,
        _admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<ProjectRef>, IdentityError> {
        Ok(self.user(user_id)?.projects)
    }

    async fn list_role_assignments(
        &self,
        _admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<RoleAssignment>, IdentityError> {
        Ok(self
            .user(user_id)?
            .projects
            .into_iter()
            .map(|p| RoleAssignment {
                role_id: "role-member".to_string(),
                role_name: "member".to_string(),
                project_id: p.id,
                project_name: p.name,
                domain_id: "default".to_string(),
                domain_name: "Default".to_string(),
            })
            .collect())
    }

    async fn fetch_matched_policies(
        &self,
        _admin: &BackendToken,
        _role_ids: &[String],
        _project_id: &str,
        _ip: &str,
    ) -> Result<MatchedPolicies, IdentityError> {
        Ok(HashMap::from([(
            "project".to_string(),
            vec!["project-member".to_string()],
        )]))
    }

    async fn list_domains(
        &self,
        _admin: &BackendToken,
        _name: Option<&str>,
    ) -> Result<Vec<Value>, IdentityError> {
        Ok(vec![json!({"id": "default", "name": "Default"})])
    }

    async fn list_idps(
        &self,
        _admin: &BackendToken,
        _sso_domain: &str,
        _auto_create_user: bool,
    ) -> Result<Vec<Value>, IdentityError> {
        Ok(vec![json!({"id": "idp-saml", "name": "corp", "driver": "saml"})])
    }

    async fn has_totp_secret(
        &self,
        _admin: &BackendToken,
        user_id: &str,
    ) -> Result<bool, IdentityError> {
        Ok(self.lock().totp_secrets.contains_key(user_id))
    }

    async fn create_totp_secret(
        &self,
        _admin: &BackendToken,
        user_id: &str,
    ) -> Result<String, IdentityError> {
        self.lock()
            .totp_secrets
            .insert(user_id.to_string(), TOTP_SECRET.to_string());
        Ok(TOTP_SECRET.to_string())
    }

    async fn totp_secret(
        &self,
        _admin: &BackendToken,
        user_id: &str,
    ) -> Result<String, IdentityError> {
        self.lock()
            .totp_secrets
            .get(user_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("totp secret of {user_id}")))
    }

    async fn remove_totp_secret(
        &self,
        _admin: &BackendToken,
        user_id: &str,
    ) -> Result<(), IdentityError> {
        self.lock().totp_secrets.remove(user_id);
        Ok(())
    }

    async fn recovery_questions(
        &self,
        _admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<RecoveryQuestion>, IdentityError> {
        Ok(self.lock().recovery.get(user_id).cloned().unwrap_or_default())
    }

    async fn save_recovery_questions(
        &self,
        _admin: &BackendToken,
        user_id: &str,
        questions: &[RecoveryQuestion],
    ) -> Result<(), IdentityError> {
        self.lock()
            .recovery
            .insert(user_id.to_string(), questions.to_vec());
        Ok(())
    }

    async fn oidc_credential(
        &self,
        _admin: &BackendToken,
        client_id: &str,
    ) -> Result<OidcClientCredential, IdentityError> {
        self.lock()
            .oidc_clients
            .get(client_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("credential {client_id}")))
    }

    async fn idp_sso_redirect(
        &self,
        _admin: &BackendToken,
        idp_id: &str,
        callback_url: &str,
        state: &str,
    ) -> Result<IdpRedirect, IdentityError> {
        Ok(IdpRedirect {
            driver: "saml".to_string(),
            uri: format!("https://idp.example/{idp_id}/sso?state={state}&cb={callback_url}"),
        })
    }

    /// `idp-saml` is the only provider; anything else is unknown.
    async fn get_idp(
        &self,
        _admin: &BackendToken,
        idp_id: &str,
    ) -> Result<IdpDetails, IdentityError> {
        if idp_id != "idp-saml" {
            return Err(IdentityError::NotFound(format!("identity provider {idp_id}")));
        }
        Ok(IdpDetails {
            id: idp_id.to_string(),
            name: "corp".to_string(),
            driver: "saml".to_string(),
            template: None,
            icon_uri: Some("https://idp.example/logo.png".to_string()),
            enabled: true,
            status: "connected".to_string(),
        })
    }

    async fn idp_saml_metadata(
        &self,
        admin: &BackendToken,
        idp_id: &str,
        redirect_uri: &str,
        _pretty: bool,
    ) -> Result<String, IdentityError> {
        let idp = self.get_idp(admin, idp_id).await?;
        Ok(format!(
            r#"<EntityDescriptor entityID="{}"><SPSSODescriptor><AssertionConsumerService Location="{redirect_uri}"/></SPSSODescriptor></EntityDescriptor>"#,
            idp.name
        ))
    }

    async fn perform_user_action(
        &self,
        _admin: &BackendToken,
        user_id: &str,
        action: &str,
        body: Value,
    ) -> Result<Value, IdentityError> {
        let mut inner = self.lock();
        inner.actions.push(format!("users/{user_id}/{action}"));
        let idp_id = body["idp_id"].as_str().unwrap_or_default();
        let entity = body["idp_entity_id"].as_str().unwrap_or_default();
        let key = format!("{idp_id}/{entity}");
        match action {
            "link-idp" => {
                inner.idp_links.insert(key, user_id.to_string());
            }
            "unlink-idp" => {
                inner.idp_links.remove(&key);
            }
            _ => {}
        }
        Ok(json!({}))
    }

    async fn update_user_password(
        &self,
        _admin: &BackendToken,
        user_id: &str,
        password: &str,
    ) -> Result<(), IdentityError> {
        let mut inner = self.lock();
        inner
            .passwords_set
            .push((user_id.to_string(), password.to_string()));
        if let Some(user) = inner.users.get_mut(user_id) {
            user.password = password.to_string();
        }
        Ok(())
    }
}
