//! Map parsed CLI arguments to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{identity, oidc, server, session, totp};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let server_opts = server::Options::parse(matches)?;
    let identity_opts = identity::Options::parse(matches)?;
    let session_opts = session::Options::parse(matches)?;
    let totp_opts = totp::Options::parse(matches);

    Ok(Action::Server(Args {
        port: server_opts.port,
        api_server: server_opts.api_server,
        request_timeout: server_opts.request_timeout,
        max_workers: server_opts.max_workers,
        auth_url: identity_opts.auth_url,
        admin_user: identity_opts.admin_user,
        admin_password: identity_opts.admin_password,
        admin_domain: identity_opts.admin_domain,
        admin_project: identity_opts.admin_project,
        region: identity_opts.region,
        dsn: session_opts.dsn,
        cookie_domain: session_opts.cookie_domain,
        session_level_auth_cookie: session_opts.session_level_auth_cookie,
        login_url: session_opts.login_url,
        login_callback_param: session_opts.login_callback_param,
        idp_link_success_url: session_opts.idp_link_success_url,
        return_full_domain_list: session_opts.return_full_domain_list,
        non_default_domain_projects: session_opts.non_default_domain_projects,
        enable_quota_check: session_opts.enable_quota_check,
        password_encrypt_key: session_opts.password_encrypt_key,
        enable_totp: totp_opts.enable_totp,
        totp_issuer: totp_opts.issuer,
        rsa_private_key: oidc::rsa_private_key(matches),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::time::Duration;

    #[test]
    fn server_action_collects_every_group() -> Result<()> {
        temp_env::with_vars(
            [
                ("APIGATEWAY_API_SERVER", Some("https://gw.example")),
                ("APIGATEWAY_AUTH_URL", Some("https://keystone:30500")),
                ("APIGATEWAY_ADMIN_USER", Some("sysadmin")),
                ("APIGATEWAY_ADMIN_PASSWORD", Some("s3cret")),
                ("APIGATEWAY_ENABLE_TOTP", Some("true")),
                ("APIGATEWAY_REGION", Some("region0")),
                ("APIGATEWAY_REQUEST_TIMEOUT", Some("20")),
                ("APIGATEWAY_DSN", None),
                ("APIGATEWAY_PORT", None),
                ("APIGATEWAY_RSA_PRIVATE_KEY", None),
            ],
            || {
                let matches = crate::cli::commands::new().try_get_matches_from(["apigateway"])?;
                let Action::Server(args) = handler(&matches)?;
                assert_eq!(args.port, 8080);
                assert_eq!(args.api_server, "https://gw.example");
                assert_eq!(args.admin_password.expose_secret(), "s3cret");
                assert_eq!(args.region.as_deref(), Some("region0"));
                assert_eq!(args.request_timeout, Duration::from_secs(20));
                assert_eq!(args.dsn, "sqlite://apigateway.db");
                assert!(args.enable_totp);
                assert_eq!(args.totp_issuer, "Cloudpods");
                assert_eq!(args.rsa_private_key, None);
                Ok(())
            },
        )
    }
}
