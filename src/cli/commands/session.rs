//! Session storage, cookies and the login page the gateway sends browsers to.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, builder::FalseyValueParser};
use secrecy::SecretString;

pub const ARG_DSN: &str = "dsn";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_SESSION_LEVEL_AUTH_COOKIE: &str = "session-level-auth-cookie";
pub const ARG_LOGIN_URL: &str = "login-url";
pub const ARG_LOGIN_CALLBACK_PARAM: &str = "login-callback-param";
pub const ARG_IDP_LINK_SUCCESS_URL: &str = "idp-link-success-url";
pub const ARG_RETURN_FULL_DOMAIN_LIST: &str = "return-full-domain-list";
pub const ARG_NON_DEFAULT_DOMAIN_PROJECTS: &str = "non-default-domain-projects";
pub const ARG_ENABLE_QUOTA_CHECK: &str = "enable-quota-check";
pub const ARG_PASSWORD_ENCRYPT_KEY: &str = "password-encrypt-key";

#[derive(Debug)]
pub struct Options {
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
}

impl Options {
    /// # Errors
    /// Returns an error if the store DSN is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let optional = |name: &str| {
            matches
                .get_one::<String>(name)
                .filter(|value| !value.is_empty())
                .cloned()
        };
        Ok(Self {
            dsn: optional(ARG_DSN).context("missing required argument: --dsn")?,
            cookie_domain: optional(ARG_COOKIE_DOMAIN),
            session_level_auth_cookie: matches.get_flag(ARG_SESSION_LEVEL_AUTH_COOKIE),
            login_url: optional(ARG_LOGIN_URL),
            login_callback_param: optional(ARG_LOGIN_CALLBACK_PARAM)
                .unwrap_or_else(|| "rf".to_string()),
            idp_link_success_url: optional(ARG_IDP_LINK_SUCCESS_URL),
            return_full_domain_list: matches.get_flag(ARG_RETURN_FULL_DOMAIN_LIST),
            non_default_domain_projects: matches.get_flag(ARG_NON_DEFAULT_DOMAIN_PROJECTS),
            enable_quota_check: matches.get_flag(ARG_ENABLE_QUOTA_CHECK),
            password_encrypt_key: optional(ARG_PASSWORD_ENCRYPT_KEY).map(SecretString::from),
        })
    }
}

fn flag(name: &'static str, env: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .help(help)
        .env(env)
        .action(ArgAction::SetTrue)
        .value_parser(FalseyValueParser::new())
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Session store connection string")
                .long_help(
                    "Session store connection string. Sessions are kept in memory and written to this SQLite file so they survive restarts.",
                )
                .env("APIGATEWAY_DSN")
                .default_value("sqlite://apigateway.db"),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Domain attribute of the session cookie")
                .env("APIGATEWAY_COOKIE_DOMAIN"),
        )
        .arg(flag(
            ARG_SESSION_LEVEL_AUTH_COOKIE,
            "APIGATEWAY_SESSION_LEVEL_AUTH_COOKIE",
            "Session cookie expires with the browser session instead of the token",
        ))
        .arg(
            Arg::new(ARG_LOGIN_URL)
                .long(ARG_LOGIN_URL)
                .help("Login page, default: <api-server>/auth/login")
                .env("APIGATEWAY_LOGIN_URL"),
        )
        .arg(
            Arg::new(ARG_LOGIN_CALLBACK_PARAM)
                .long(ARG_LOGIN_CALLBACK_PARAM)
                .help("Query parameter carrying the URL to return to after login")
                .env("APIGATEWAY_LOGIN_CALLBACK_PARAM")
                .default_value("rf"),
        )
        .arg(
            Arg::new(ARG_IDP_LINK_SUCCESS_URL)
                .long(ARG_IDP_LINK_SUCCESS_URL)
                .help("Page shown after linking an external identity, default: <api-server>/user/idp")
                .env("APIGATEWAY_IDP_LINK_SUCCESS_URL"),
        )
        .arg(flag(
            ARG_RETURN_FULL_DOMAIN_LIST,
            "APIGATEWAY_RETURN_FULL_DOMAIN_LIST",
            "List every enabled domain on the login page",
        ))
        .arg(flag(
            ARG_NON_DEFAULT_DOMAIN_PROJECTS,
            "APIGATEWAY_NON_DEFAULT_DOMAIN_PROJECTS",
            "Tell the console projects may live outside the default domain",
        ))
        .arg(flag(
            ARG_ENABLE_QUOTA_CHECK,
            "APIGATEWAY_ENABLE_QUOTA_CHECK",
            "Tell the console quota checks are enforced",
        ))
        .arg(
            Arg::new(ARG_PASSWORD_ENCRYPT_KEY)
                .long(ARG_PASSWORD_ENCRYPT_KEY)
                .help("AES-256 key the console encrypts submitted passwords with")
                .env("APIGATEWAY_PASSWORD_ENCRYPT_KEY")
                .hide_env_values(true),
        )
}
