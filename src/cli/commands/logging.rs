//! Log verbosity and output format.

use clap::{
    Arg, ArgAction, ArgMatches, Command,
    builder::{PossibleValuesParser, ValueParser},
};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ARG_LOG_FORMAT: &str = "log-format";

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub level: Level,
    pub format: LogFormat,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let verbosity = matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0);
        let format = match matches.get_one::<String>(ARG_LOG_FORMAT).map(String::as_str) {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        Self {
            level: level_for(verbosity),
            format,
        }
    }
}

/// Errors only by default; each `-v` opens one more level.
const fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// `APIGATEWAY_LOG_LEVEL` takes a level name or its index in [`LEVELS`].
fn parse_level(level: &str) -> Result<u8, String> {
    if let Ok(index) = level.parse::<u8>()
        && usize::from(index) < LEVELS.len()
    {
        return Ok(index);
    }
    let lowered = level.to_lowercase();
    LEVELS
        .iter()
        .position(|name| *name == lowered)
        .and_then(|index| u8::try_from(index).ok())
        .ok_or_else(|| format!("invalid log level {level:?}, expected one of {LEVELS:?}"))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("APIGATEWAY_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(ValueParser::from(parse_level)),
        )
        .arg(
            Arg::new(ARG_LOG_FORMAT)
                .long(ARG_LOG_FORMAT)
                .help("Log output format")
                .env("APIGATEWAY_LOG_FORMAT")
                .global(true)
                .default_value("text")
                .value_parser(PossibleValuesParser::new(["text", "json"])),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str], env: &[(&str, Option<&str>)]) -> Result<Options, clap::Error> {
        let mut vars = vec![
            ("APIGATEWAY_LOG_LEVEL", None),
            ("APIGATEWAY_LOG_FORMAT", None),
        ];
        vars.retain(|(name, _)| !env.iter().any(|(set, _)| set == name));
        vars.extend_from_slice(env);
        temp_env::with_vars(vars, || {
            let matches = with_args(Command::new("test")).try_get_matches_from(args)?;
            Ok(Options::parse(&matches))
        })
    }

    #[test]
    fn defaults_to_errors_as_text() {
        let options = parse(&["test"], &[]).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(options.level, Level::ERROR);
        assert_eq!(options.format, LogFormat::Text);
    }

    #[test]
    fn verbosity_counts_flags() {
        let options = parse(&["test", "-vvv"], &[]).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(options.level, Level::DEBUG);
        let options = parse(&["test", "-vvvvvvv"], &[]).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(options.level, Level::TRACE);
    }

    #[test]
    fn env_selects_level_and_json() {
        let options = parse(
            &["test"],
            &[
                ("APIGATEWAY_LOG_LEVEL", Some("INFO")),
                ("APIGATEWAY_LOG_FORMAT", Some("json")),
            ],
        )
        .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(options.level, Level::INFO);
        assert_eq!(options.format, LogFormat::Json);
    }

    #[test]
    fn unknown_level_or_format_is_rejected() {
        assert!(parse(&["test"], &[("APIGATEWAY_LOG_LEVEL", Some("loud"))]).is_err());
        assert!(parse(&["test", "--log-format", "xml"], &[]).is_err());
        assert!(parse_level("9").is_err());
        assert_eq!(parse_level("3"), Ok(3));
    }
}
