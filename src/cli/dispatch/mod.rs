use crate::cli::{
    actions::{server::Args, Action},
    commands::{self, basic, oidc, static_users, sync},
};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    commands::validate(matches).map_err(|e| anyhow!(e))?;

    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let base_url = matches
        .get_one::<String>(commands::ARG_BASE_URL)
        .context("missing required argument: --base-url")?;
    let base_url = Url::parse(base_url).context("invalid AUTHBROKER_BASE_URL")?;
    let session_ttl = Duration::from_secs(
        matches
            .get_one::<u64>(commands::ARG_SESSION_TTL_SECONDS)
            .copied()
            .unwrap_or(crate::session::DEFAULT_SESSION_TTL_SECONDS),
    );

    Ok(Action::Server(Args {
        port,
        base_url,
        session_ttl,
        oidc: oidc::Options::parse(matches)?,
        basic: basic::Options::parse(matches)?,
        static_users: static_users::Options::parse(matches)?,
        sync: sync::Options::parse(matches)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_builds_server_action() -> Result<()> {
        temp_env::with_vars(
            [
                ("AUTHBROKER_OIDC_ISSUER", None::<&str>),
                ("AUTHBROKER_BASIC_USERS", None::<&str>),
                ("AUTHBROKER_SINGLE_SESSION", None::<&str>),
            ],
            || {
                let matches = commands::new().get_matches_from(vec![
                    "authbroker",
                    "--port",
                    "9000",
                    "--base-url",
                    "https://app.example.test/",
                    "--static-users",
                    "alice",
                ]);
                let Action::Server(args) = handler(&matches)?;
                assert_eq!(args.port, 9000);
                assert_eq!(args.base_url.as_str(), "https://app.example.test/");
                assert_eq!(args.session_ttl, Duration::from_secs(43200));
                assert!(args.oidc.is_none());
                assert!(args.basic.is_none());
                assert!(args.sync.is_none());
                assert_eq!(
                    args.static_users.map(|s| s.users),
                    Some(vec!["alice".to_string()])
                );
                Ok(())
            },
        )
    }

    #[test]
    fn test_handler_rejects_invalid_base_url() {
        let matches = commands::new().get_matches_from(vec![
            "authbroker",
            "--base-url",
            "not a url",
            "--static-users",
            "alice",
        ]);
        assert!(handler(&matches).is_err());
    }
}
