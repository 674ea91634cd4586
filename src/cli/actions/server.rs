use crate::{
    admin::AdminContext,
    api::{
        self, ServerLimits,
        handlers::auth::{AuthConfig, AuthState},
    },
    identity::{AdminCredentials, IdentityBackend, keystone::KeystoneClient},
    session::{Envelope, SessionStore},
    totp::TotpEngine,
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub api_server: String,
    pub request_timeout: Duration,
    pub max_workers: usize,
    pub auth_url: String,
    pub admin_user: String,
    pub admin_password: SecretString,
    pub admin_domain: String,
    pub admin_project: String,
    pub region: Option<String>,
    pub dsn: String,
    pub cookie_domain: Option<String>,
    pub session_level_auth_cookie: bool,
    pub login_url: Option<String>,
    pub login_callback_param: String,
    pub idp_link_success_url: Option<String>,
    pub return_full_domain_list: bool,
    pub non_default_domain_projects: bool,
    pub enable_quota_check: bool,
    pub password_encrypt_key: Option<SecretString>,
    pub enable_totp: bool,
    pub totp_issuer: String,
    pub rsa_private_key: Option<PathBuf>,
}

impl Args {
    fn auth_config(&self) -> AuthConfig {
        let mut config = AuthConfig::new(self.api_server.clone())
            .with_login_callback_param(self.login_callback_param.clone())
            .with_cookie_domain(self.cookie_domain.clone())
            .with_session_level_auth_cookie(self.session_level_auth_cookie)
            .with_enable_totp(self.enable_totp)
            .with_default_region(self.region.clone())
            .with_return_full_domain_list(self.return_full_domain_list)
            .with_non_default_domain_projects(self.non_default_domain_projects)
            .with_enable_quota_check(self.enable_quota_check);
        if let Some(url) = &self.login_url {
            config = config.with_login_url(url.clone());
        }
        if let Some(url) = &self.idp_link_success_url {
            config = config.with_idp_link_success_url(url.clone());
        }
        if let Some(key) = &self.password_encrypt_key {
            config = config.with_password_key(key.clone());
        }
        config
    }

    fn envelope(&self) -> Result<Envelope> {
        match &self.rsa_private_key {
            Some(path) => Envelope::from_key_file(path),
            None => {
                warn!("no RSA private key configured, session tokens are not encrypted");
                Ok(Envelope::plain())
            }
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the session store or RSA key cannot be loaded, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let config = args.auth_config();
    let envelope = args.envelope()?;

    let backend: Arc<dyn IdentityBackend> = Arc::new(
        KeystoneClient::new(&args.auth_url, args.request_timeout)
            .context("Invalid identity backend URL")?,
    );

    let admin = AdminContext::new(
        backend.clone(),
        AdminCredentials {
            user: args.admin_user,
            password: args.admin_password,
            domain: args.admin_domain,
            project: args.admin_project,
        },
    );
    // acquires right away, admin-only routes fail until it succeeds
    let _refresh = admin.spawn_refresh();

    let store = Arc::new(
        SessionStore::connect(&args.dsn)
            .await
            .context("Could not open the session store")?,
    );

    let totp = TotpEngine::new(backend.clone(), args.totp_issuer);
    let state = Arc::new(AuthState::new(
        config,
        backend,
        admin,
        store.clone(),
        envelope,
        totp,
    ));

    let served = api::new(
        args.port,
        state,
        ServerLimits {
            request_timeout: args.request_timeout,
            max_workers: args.max_workers,
        },
    )
    .await;

    store.flush().await;
    info!("session store flushed");
    served
}
