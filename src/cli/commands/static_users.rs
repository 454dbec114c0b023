use anyhow::{bail, Result};
use clap::{Arg, ArgMatches, Command};

pub const ARG_STATIC_USERS: &str = "static-users";
pub const ARG_STATIC_BROKER: &str = "static-broker";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_STATIC_USERS)
                .long(ARG_STATIC_USERS)
                .help("Comma separated user names offered by the pick-a-user login page (development only)")
                .env("AUTHBROKER_STATIC_USERS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_STATIC_BROKER)
                .long(ARG_STATIC_BROKER)
                .help("Static broker name")
                .env("AUTHBROKER_STATIC_BROKER")
                .default_value("static"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub broker: String,
    pub users: Vec<String>,
}

impl Options {
    /// `None` unless users are configured.
    ///
    /// # Errors
    /// Returns an error if the list only contains blanks.
    pub fn parse(matches: &ArgMatches) -> Result<Option<Self>> {
        let Some(values) = matches.get_many::<String>(ARG_STATIC_USERS) else {
            return Ok(None);
        };
        let users: Vec<String> = values
            .map(|user| user.trim().to_string())
            .filter(|user| !user.is_empty())
            .collect();
        if users.is_empty() {
            bail!("--{ARG_STATIC_USERS} has no user names");
        }

        Ok(Some(Self {
            broker: matches
                .get_one::<String>(ARG_STATIC_BROKER)
                .cloned()
                .unwrap_or_else(|| "static".to_string()),
            users,
        }))
    }
}
