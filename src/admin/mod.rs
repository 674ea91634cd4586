//! Process-wide service-account credential.
//!
//! The credential is acquired once at startup and refreshed in the background
//! at half its remaining lifetime. Readers take a snapshot through
//! [`AdminContext::current`]; a refresh replaces the whole token at once.

use crate::identity::{AdminCredentials, BackendToken, IdentityBackend};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{debug, error, info, instrument, warn};

/// Delay between failed authentication attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AdminContext {
    backend: Arc<dyn IdentityBackend>,
    credentials: Arc<AdminCredentials>,
    retry_interval: Duration,
    tx: Arc<watch::Sender<Option<Arc<BackendToken>>>>,
}

impl AdminContext {
    #[must_use]
    pub fn new(backend: Arc<dyn IdentityBackend>, credentials: AdminCredentials) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            backend,
            credentials: Arc::new(credentials),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            tx: Arc::new(tx),
        }
    }

    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Snapshot of the current credential, `None` until the first acquisition.
    #[must_use]
    pub fn current(&self) -> Option<Arc<BackendToken>> {
        self.tx.borrow().clone()
    }

    /// Replace the credential.
    pub fn install(&self, token: BackendToken) {
        self.tx.send_replace(Some(Arc::new(token)));
    }

    /// Non-empty regions advertised by the current credential.
    #[must_use]
    pub fn regions(&self) -> Vec<String> {
        self.current()
            .map(|token| {
                token
                    .regions
                    .iter()
                    .filter(|r| !r.is_empty())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Authenticate until it succeeds, sleeping `retry_interval` between attempts.
    #[instrument(skip(self), fields(user = %self.credentials.user))]
    pub async fn acquire(&self) -> Arc<BackendToken> {
        loop {
            match self.backend.authenticate_admin(&self.credentials).await {
                Ok(token) => {
                    info!(
                        "admin credential acquired, expires at {}",
                        token.expires_at.to_rfc3339()
                    );
                    let token = Arc::new(token);
                    self.tx.send_replace(Some(token.clone()));
                    return token;
                }
                Err(e) => {
                    error!(
                        "failed to acquire admin credential: {}, retrying in {} seconds",
                        e,
                        self.retry_interval.as_secs()
                    );
                    sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Keep the credential fresh: re-authenticate at half the remaining
    /// lifetime of the current token, forever.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = ctx
                    .current()
                    .map_or(Duration::ZERO, |token| refresh_delay(&token, Utc::now()));
                debug!("next admin credential refresh in {} seconds", delay.as_secs());
                sleep(delay).await;

                if ctx.current().is_none() {
                    warn!("no admin credential installed, acquiring");
                }
                ctx.acquire().await;
            }
        })
    }
}

/// Half of the lifetime left on `token` at `now`, never less than one second.
#[must_use]
pub fn refresh_delay(token: &BackendToken, now: DateTime<Utc>) -> Duration {
    Duration::from_secs((token.remaining_seconds(now) / 2).max(1))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::MockBackend;
    use secrecy::SecretString;

    fn credentials(password: &str) -> AdminCredentials {
        AdminCredentials {
            user: "sysadmin".to_string(),
            password: SecretString::from(password.to_string()),
            domain: "Default".to_string(),
            project: "system".to_string(),
        }
    }

    #[test]
    fn refresh_at_half_remaining() {
        let now = Utc::now();
        let token = BackendToken {
            id: "t".to_string(),
            expires_at: now + chrono::Duration::seconds(3600),
            ..BackendToken::default()
        };
        assert_eq!(refresh_delay(&token, now), Duration::from_secs(1800));

        let expired = BackendToken {
            expires_at: now - chrono::Duration::seconds(5),
            ..token
        };
        assert_eq!(refresh_delay(&expired, now), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn acquire_installs_credential() {
        let ctx = AdminContext::new(Arc::new(MockBackend::new()), credentials("admin"));
        assert!(ctx.current().is_none());
        let token = ctx.acquire().await;
        assert_eq!(ctx.current().unwrap().id, token.id);
        assert_eq!(ctx.regions(), vec!["region0".to_string()]);
    }

    #[tokio::test]
    async fn acquire_retries_until_success() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_admin_auth(2);
        let ctx = AdminContext::new(backend.clone(), credentials("admin"))
            .with_retry_interval(Duration::from_millis(5));
        let token = ctx.acquire().await;
        assert!(token.is_valid());
        assert_eq!(backend.admin_auth_attempts(), 3);
    }

    #[test]
    fn install_replaces_snapshot() {
        let ctx = AdminContext::new(Arc::new(MockBackend::new()), credentials("admin"));
        ctx.install(BackendToken {
            id: "first".to_string(),
            ..BackendToken::default()
        });
        let before = ctx.current().unwrap();
        ctx.install(BackendToken {
            id: "second".to_string(),
            ..BackendToken::default()
        });
        assert_eq!(before.id, "first");
        assert_eq!(ctx.current().unwrap().id, "second");
    }
}
