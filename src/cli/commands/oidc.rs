use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

pub const ARG_RSA_PRIVATE_KEY: &str = "rsa-private-key";

/// Path of the RSA key that seals session tokens and signs ID tokens.
#[must_use]
pub fn rsa_private_key(matches: &ArgMatches) -> Option<PathBuf> {
    matches.get_one::<PathBuf>(ARG_RSA_PRIVATE_KEY).cloned()
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_RSA_PRIVATE_KEY)
            .long(ARG_RSA_PRIVATE_KEY)
            .help("RSA private key (PEM or DER)")
            .long_help(
                "RSA private key (PEM or DER). Session tokens are sealed with it and OIDC ID tokens signed with it; without a key session tokens are only compressed and OIDC keys are unavailable.",
            )
            .env("APIGATEWAY_RSA_PRIVATE_KEY")
            .value_parser(clap::value_parser!(PathBuf)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_is_optional() {
        temp_env::with_vars([("APIGATEWAY_RSA_PRIVATE_KEY", None::<&str>)], || {
            let matches = with_args(Command::new("test")).get_matches_from(["test"]);
            assert_eq!(rsa_private_key(&matches), None);

            let matches = with_args(Command::new("test")).get_matches_from([
                "test",
                "--rsa-private-key",
                "/etc/apigateway/key.pem",
            ]);
            assert_eq!(
                rsa_private_key(&matches),
                Some(PathBuf::from("/etc/apigateway/key.pem"))
            );
        });
    }
}
