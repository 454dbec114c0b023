pub mod basic;
pub mod logging;
pub mod oidc;
pub mod static_users;
pub mod sync;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_PORT: &str = "port";
pub const ARG_BASE_URL: &str = "base-url";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";

/// Validate cross-argument requirements clap cannot express.
///
/// # Errors
/// Returns an error string if no broker is configured or the file backend has no directory.
pub fn validate(matches: &clap::ArgMatches) -> Result<(), String> {
    let brokers = [
        oidc::ARG_OIDC_ISSUER,
        basic::ARG_BASIC_USERS,
        static_users::ARG_STATIC_USERS,
    ];
    if !brokers.iter().any(|arg| matches.contains_id(arg)) {
        return Err(
            "At least one broker is required: --oidc-issuer, --basic-users or --static-users"
                .to_string(),
        );
    }

    if matches.get_flag(sync::ARG_SINGLE_SESSION)
        && matches
            .get_one::<String>(sync::ARG_SYNC_BACKEND)
            .is_some_and(|backend| backend == "file")
        && !matches.contains_id(sync::ARG_SYNC_FILE_PATH)
    {
        return Err(
            "Missing required argument: --sync-file-path (required for the file backend)"
                .to_string(),
        );
    }
    Ok(())
}

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

    let command = Command::new("authbroker")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("AUTHBROKER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_BASE_URL)
                .long(ARG_BASE_URL)
                .help("Public URL of this service, used for callback and redirect URLs")
                .default_value("http://localhost:8080")
                .env("AUTHBROKER_BASE_URL"),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Idle lifetime of a server-side session")
                .default_value("43200")
                .env("AUTHBROKER_SESSION_TTL_SECONDS")
                .value_parser(clap::value_parser!(u64)),
        );

    let command = oidc::with_args(command);
    let command = basic::with_args(command);
    let command = static_users::with_args(command);
    let command = sync::with_args(command);
    logging::with_args(command)
}
