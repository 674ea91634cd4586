//! Auth configuration and the shared state handed to every handler.

use crate::{
    admin::AdminContext,
    error::{ApiError, ApiResult},
    identity::{BackendToken, IdentityBackend},
    session::{Envelope, SessionStore},
    totp::TotpEngine,
};
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use super::rpc::RpcRegistry;

const DEFAULT_LOGIN_CALLBACK_PARAM: &str = "rf";
const DEFAULT_PASSWORD_KEY: &str = "apigateway-console-password-key";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    api_server: String,
    login_url: String,
    login_callback_param: String,
    idp_link_success_url: String,
    cookie_domain: Option<String>,
    session_level_auth_cookie: bool,
    enable_totp: bool,
    default_region: Option<String>,
    return_full_domain_list: bool,
    non_default_domain_projects: bool,
    enable_quota_check: bool,
    password_key: SecretString,
}

impl AuthConfig {
    #[must_use]
    pub fn new(api_server: String) -> Self {
        let api_server = api_server.trim_end_matches('/').to_string();
        Self {
            login_url: format!("{api_server}/auth/login"),
            login_callback_param: DEFAULT_LOGIN_CALLBACK_PARAM.to_string(),
            idp_link_success_url: format!("{api_server}/user/idp"),
            api_server,
            cookie_domain: None,
            session_level_auth_cookie: false,
            enable_totp: false,
            default_region: None,
            return_full_domain_list: false,
            non_default_domain_projects: false,
            enable_quota_check: false,
            password_key: SecretString::from(DEFAULT_PASSWORD_KEY.to_string()),
        }
    }

    #[must_use]
    pub fn with_login_url(mut self, url: String) -> Self {
        self.login_url = url;
        self
    }

    #[must_use]
    pub fn with_login_callback_param(mut self, param: String) -> Self {
        if !param.is_empty() {
            self.login_callback_param = param;
        }
        self
    }

    #[must_use]
    pub fn with_idp_link_success_url(mut self, url: String) -> Self {
        self.idp_link_success_url = url;
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain.filter(|d| !d.is_empty());
        self
    }

    #[must_use]
    pub fn with_session_level_auth_cookie(mut self, enabled: bool) -> Self {
        self.session_level_auth_cookie = enabled;
        self
    }

    #[must_use]
    pub fn with_enable_totp(mut self, enabled: bool) -> Self {
        self.enable_totp = enabled;
        self
    }

    #[must_use]
    pub fn with_default_region(mut self, region: Option<String>) -> Self {
        self.default_region = region.filter(|r| !r.is_empty());
        self
    }

    #[must_use]
    pub fn with_return_full_domain_list(mut self, enabled: bool) -> Self {
        self.return_full_domain_list = enabled;
        self
    }

    #[must_use]
    pub fn with_non_default_domain_projects(mut self, enabled: bool) -> Self {
        self.non_default_domain_projects = enabled;
        self
    }

    #[must_use]
    pub fn with_enable_quota_check(mut self, enabled: bool) -> Self {
        self.enable_quota_check = enabled;
        self
    }

    #[must_use]
    pub fn with_password_key(mut self, key: SecretString) -> Self {
        if !key.expose_secret().is_empty() {
            self.password_key = key;
        }
        self
    }

    /// Public base URL, without a trailing slash.
    #[must_use]
    pub fn api_server(&self) -> &str {
        &self.api_server
    }

    #[must_use]
    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    #[must_use]
    pub fn login_callback_param(&self) -> &str {
        &self.login_callback_param
    }

    #[must_use]
    pub fn idp_link_success_url(&self) -> &str {
        &self.idp_link_success_url
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    #[must_use]
    pub fn session_level_auth_cookie(&self) -> bool {
        self.session_level_auth_cookie
    }

    /// Global TOTP switch.
    #[must_use]
    pub fn enable_totp(&self) -> bool {
        self.enable_totp
    }

    #[must_use]
    pub fn default_region(&self) -> Option<&str> {
        self.default_region.as_deref()
    }

    #[must_use]
    pub fn return_full_domain_list(&self) -> bool {
        self.return_full_domain_list
    }

    #[must_use]
    pub fn non_default_domain_projects(&self) -> bool {
        self.non_default_domain_projects
    }

    #[must_use]
    pub fn enable_quota_check(&self) -> bool {
        self.enable_quota_check
    }

    /// Key for passwords the console submits encrypted.
    #[must_use]
    pub fn password_key(&self) -> &[u8] {
        self.password_key.expose_secret().as_bytes()
    }

    /// Where external IDPs post their responses back.
    #[must_use]
    pub fn sso_callback_url(&self) -> String {
        format!("{}/api/v1/auth/ssologin", self.api_server)
    }

    /// Assertion consumer for responses `idp_id` sends unprompted.
    #[must_use]
    pub fn idp_initiated_callback_url(&self, idp_id: &str) -> String {
        format!("{}/{idp_id}", self.sso_callback_url())
    }
}

/// Wall clock with an adjustable offset, so lock windows and code lifetimes
/// can be exercised without sleeping.
#[derive(Debug, Default)]
pub struct Clock {
    offset_seconds: AtomicI64,
}

impl Clock {
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(self.offset_seconds.load(Ordering::Relaxed))
    }

    /// Current time as 32-bit unix seconds, the resolution of TOTP lock windows.
    #[must_use]
    pub fn unix(&self) -> u32 {
        u32::try_from(self.now().timestamp()).unwrap_or(u32::MAX)
    }

    pub fn advance(&self, seconds: i64) {
        self.offset_seconds.fetch_add(seconds, Ordering::Relaxed);
    }
}

pub struct AuthState {
    config: AuthConfig,
    backend: Arc<dyn IdentityBackend>,
    admin: AdminContext,
    store: Arc<SessionStore>,
    envelope: Envelope,
    totp: TotpEngine,
    clock: Clock,
    rpc: RpcRegistry,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        backend: Arc<dyn IdentityBackend>,
        admin: AdminContext,
        store: Arc<SessionStore>,
        envelope: Envelope,
        totp: TotpEngine,
    ) -> Self {
        Self {
            config,
            backend,
            admin,
            store,
            envelope,
            totp,
            clock: Clock::default(),
            rpc: RpcRegistry::with_defaults(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &dyn IdentityBackend {
        self.backend.as_ref()
    }

    #[must_use]
    pub fn admin(&self) -> &AdminContext {
        &self.admin
    }

    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    #[must_use]
    pub fn totp(&self) -> &TotpEngine {
        &self.totp
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(super) fn rpc(&self) -> &RpcRegistry {
        &self.rpc
    }

    /// Current admin credential, or an internal error before the first acquisition.
    ///
    /// # Errors
    /// Returns [`ApiError::InternalServer`] when no credential is installed.
    pub fn admin_token(&self) -> ApiResult<Arc<BackendToken>> {
        self.admin
            .current()
            .ok_or_else(|| ApiError::InternalServer("failed to get admin credential".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_hang_off_api_server() {
        let config = AuthConfig::new("https://gw.example/".to_string());
        assert_eq!(config.api_server(), "https://gw.example");
        assert_eq!(config.login_url(), "https://gw.example/auth/login");
        assert_eq!(config.login_callback_param(), "rf");
        assert_eq!(config.idp_link_success_url(), "https://gw.example/user/idp");
        assert_eq!(
            config.sso_callback_url(),
            "https://gw.example/api/v1/auth/ssologin"
        );
        assert_eq!(
            config.idp_initiated_callback_url("idp-1"),
            "https://gw.example/api/v1/auth/ssologin/idp-1"
        );
        assert!(!config.enable_totp());
    }

    #[test]
    fn empty_overrides_are_ignored() {
        let config = AuthConfig::new("https://gw.example".to_string())
            .with_login_callback_param(String::new())
            .with_cookie_domain(Some(String::new()))
            .with_default_region(Some(String::new()));
        assert_eq!(config.login_callback_param(), "rf");
        assert_eq!(config.cookie_domain(), None);
        assert_eq!(config.default_region(), None);
    }

    #[test]
    fn clock_advances() {
        let clock = Clock::default();
        let before = clock.unix();
        clock.advance(31);
        assert!(clock.unix() >= before + 31);
    }
}
