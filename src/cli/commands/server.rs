use anyhow::{Context, Result, ensure};
use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

pub const ARG_PORT: &str = "port";
pub const ARG_API_SERVER: &str = "api-server";
pub const ARG_REQUEST_TIMEOUT: &str = "request-timeout";
pub const ARG_MAX_WORKERS: &str = "max-workers";

#[derive(Debug)]
pub struct Options {
    pub port: u16,
    pub api_server: String,
    pub request_timeout: Duration,
    pub max_workers: usize,
}

impl Options {
    /// # Errors
    /// Returns an error if the public URL is missing or a limit is zero.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let api_server = matches
            .get_one::<String>(ARG_API_SERVER)
            .cloned()
            .context("missing required argument: --api-server")?;
        let timeout = matches
            .get_one::<u64>(ARG_REQUEST_TIMEOUT)
            .copied()
            .unwrap_or(15);
        let max_workers = matches
            .get_one::<usize>(ARG_MAX_WORKERS)
            .copied()
            .unwrap_or(1024);
        ensure!(timeout > 0, "--{ARG_REQUEST_TIMEOUT} must be positive");
        ensure!(max_workers > 0, "--{ARG_MAX_WORKERS} must be positive");

        Ok(Self {
            port: matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080),
            api_server,
            request_timeout: Duration::from_secs(timeout),
            max_workers,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("APIGATEWAY_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_API_SERVER)
                .long(ARG_API_SERVER)
                .help("Public base URL of the gateway, example: https://console.example.com")
                .env("APIGATEWAY_API_SERVER")
                .required(true),
        )
        .arg(
            Arg::new(ARG_REQUEST_TIMEOUT)
                .long(ARG_REQUEST_TIMEOUT)
                .help("Request timeout in seconds, also used for identity backend calls")
                .env("APIGATEWAY_REQUEST_TIMEOUT")
                .default_value("15")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_MAX_WORKERS)
                .long(ARG_MAX_WORKERS)
                .help("Maximum number of requests served concurrently")
                .env("APIGATEWAY_MAX_WORKERS")
                .default_value("1024")
                .value_parser(clap::value_parser!(usize)),
        )
}
