//! Identity backend endpoint and the service account the gateway acts with.

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_AUTH_URL: &str = "auth-url";
pub const ARG_ADMIN_USER: &str = "admin-user";
pub const ARG_ADMIN_PASSWORD: &str = "admin-password";
pub const ARG_ADMIN_DOMAIN: &str = "admin-domain";
pub const ARG_ADMIN_PROJECT: &str = "admin-project";
pub const ARG_REGION: &str = "region";

#[derive(Debug)]
pub struct Options {
    pub auth_url: String,
    pub admin_user: String,
    pub admin_password: SecretString,
    pub admin_domain: String,
    pub admin_project: String,
    pub region: Option<String>,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let required = |name: &str| {
            matches
                .get_one::<String>(name)
                .cloned()
                .with_context(|| format!("missing required argument: --{name}"))
        };
        Ok(Self {
            auth_url: required(ARG_AUTH_URL)?,
            admin_user: required(ARG_ADMIN_USER)?,
            admin_password: SecretString::from(required(ARG_ADMIN_PASSWORD)?),
            admin_domain: required(ARG_ADMIN_DOMAIN)?,
            admin_project: required(ARG_ADMIN_PROJECT)?,
            region: matches
                .get_one::<String>(ARG_REGION)
                .filter(|region| !region.is_empty())
                .cloned(),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_AUTH_URL)
                .long(ARG_AUTH_URL)
                .help("Identity backend base URL, example: https://keystone:30500")
                .env("APIGATEWAY_AUTH_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_ADMIN_USER)
                .long(ARG_ADMIN_USER)
                .help("Service account user")
                .env("APIGATEWAY_ADMIN_USER")
                .required(true),
        )
        .arg(
            Arg::new(ARG_ADMIN_PASSWORD)
                .long(ARG_ADMIN_PASSWORD)
                .help("Service account password")
                .env("APIGATEWAY_ADMIN_PASSWORD")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_ADMIN_DOMAIN)
                .long(ARG_ADMIN_DOMAIN)
                .help("Domain of the service account")
                .env("APIGATEWAY_ADMIN_DOMAIN")
                .default_value("Default"),
        )
        .arg(
            Arg::new(ARG_ADMIN_PROJECT)
                .long(ARG_ADMIN_PROJECT)
                .help("Project the service account is scoped to")
                .env("APIGATEWAY_ADMIN_PROJECT")
                .default_value("system"),
        )
        .arg(
            Arg::new(ARG_REGION)
                .long(ARG_REGION)
                .help("Default region when the request carries no region cookie")
                .env("APIGATEWAY_REGION"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn admin_defaults_and_secret() -> Result<()> {
        temp_env::with_vars(
            [
                ("APIGATEWAY_AUTH_URL", Some("https://keystone:30500")),
                ("APIGATEWAY_ADMIN_USER", Some("sysadmin")),
                ("APIGATEWAY_ADMIN_PASSWORD", Some("s3cret")),
                ("APIGATEWAY_ADMIN_DOMAIN", None),
                ("APIGATEWAY_ADMIN_PROJECT", None),
                ("APIGATEWAY_REGION", None),
            ],
            || {
                let matches = with_args(Command::new("test")).try_get_matches_from(["test"])?;
                let options = Options::parse(&matches)?;
                assert_eq!(options.auth_url, "https://keystone:30500");
                assert_eq!(options.admin_user, "sysadmin");
                assert_eq!(options.admin_password.expose_secret(), "s3cret");
                assert_eq!(options.admin_domain, "Default");
                assert_eq!(options.admin_project, "system");
                assert_eq!(options.region, None);
                assert!(!format!("{options:?}").contains("s3cret"));
                Ok(())
            },
        )
    }

    #[test]
    fn admin_password_is_required() {
        temp_env::with_vars(
            [
                ("APIGATEWAY_AUTH_URL", Some("https://keystone:30500")),
                ("APIGATEWAY_ADMIN_USER", Some("sysadmin")),
                ("APIGATEWAY_ADMIN_PASSWORD", None),
            ],
            || {
                let result = with_args(Command::new("test")).try_get_matches_from(["test"]);
                assert_eq!(
                    result.map_err(|e| e.kind()).err(),
                    Some(clap::error::ErrorKind::MissingRequiredArgument)
                );
            },
        );
    }
}
