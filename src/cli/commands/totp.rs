use clap::{Arg, ArgAction, ArgMatches, Command, builder::FalseyValueParser};

pub const ARG_ENABLE_TOTP: &str = "enable-totp";
pub const ARG_TOTP_ISSUER: &str = "totp-issuer";

#[derive(Debug)]
pub struct Options {
    pub enable_totp: bool,
    pub issuer: String,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            enable_totp: matches.get_flag(ARG_ENABLE_TOTP),
            issuer: matches
                .get_one::<String>(ARG_TOTP_ISSUER)
                .cloned()
                .unwrap_or_else(|| "Cloudpods".to_string()),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ENABLE_TOTP)
                .long(ARG_ENABLE_TOTP)
                .help("Require a TOTP passcode from users with MFA enabled")
                .env("APIGATEWAY_ENABLE_TOTP")
                .action(ArgAction::SetTrue)
                .value_parser(FalseyValueParser::new()),
        )
        .arg(
            Arg::new(ARG_TOTP_ISSUER)
                .long(ARG_TOTP_ISSUER)
                .help("Issuer shown by authenticator apps")
                .env("APIGATEWAY_TOTP_ISSUER")
                .default_value("Cloudpods"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totp_is_off_by_default() {
        temp_env::with_vars(
            [
                ("APIGATEWAY_ENABLE_TOTP", None::<&str>),
                ("APIGATEWAY_TOTP_ISSUER", None),
            ],
            || {
                let options =
                    Options::parse(&with_args(Command::new("test")).get_matches_from(["test"]));
                assert!(!options.enable_totp);
                assert_eq!(options.issuer, "Cloudpods");
            },
        );
    }

    #[test]
    fn totp_from_env() {
        temp_env::with_vars(
            [
                ("APIGATEWAY_ENABLE_TOTP", Some("yes")),
                ("APIGATEWAY_TOTP_ISSUER", Some("Acme")),
            ],
            || {
                let options =
                    Options::parse(&with_args(Command::new("test")).get_matches_from(["test"]));
                assert!(options.enable_totp);
                assert_eq!(options.issuer, "Acme");
            },
        );
    }
}
