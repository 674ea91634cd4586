pub mod identity;
pub mod logging;
pub mod oidc;
pub mod server;
pub mod session;
pub mod totp;

use clap::{
    ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("apigateway")
        .about("API gateway authentication service")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles);

    let command = server::with_args(command);
    let command = identity::with_args(command);
    let command = session::with_args(command);
    let command = totp::with_args(command);
    let command = oidc::with_args(command);
    logging::with_args(command)
}
