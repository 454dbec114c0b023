use crate::auth::basic::{parse_users, DEFAULT_REALM};
use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::collections::HashMap;

pub const ARG_BASIC_USERS: &str = "basic-users";
pub const ARG_BASIC_BROKER: &str = "basic-broker";
pub const ARG_BASIC_REALM: &str = "basic-realm";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BASIC_USERS)
                .long(ARG_BASIC_USERS)
                .help("Comma separated user:password pairs; enables the HTTP Basic broker")
                .env("AUTHBROKER_BASIC_USERS")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_BASIC_BROKER)
                .long(ARG_BASIC_BROKER)
                .help("HTTP Basic broker name")
                .env("AUTHBROKER_BASIC_BROKER")
                .default_value("basic"),
        )
        .arg(
            Arg::new(ARG_BASIC_REALM)
                .long(ARG_BASIC_REALM)
                .help("Realm sent in the WWW-Authenticate challenge")
                .env("AUTHBROKER_BASIC_REALM")
                .default_value(DEFAULT_REALM),
        )
}

#[derive(Debug)]
pub struct Options {
    pub broker: String,
    pub realm: String,
    pub users: HashMap<String, SecretString>,
}

impl Options {
    /// `None` unless users are configured.
    ///
    /// # Errors
    /// Returns an error if the user list is malformed.
    pub fn parse(matches: &ArgMatches) -> Result<Option<Self>> {
        let Some(users) = matches.get_one::<String>(ARG_BASIC_USERS) else {
            return Ok(None);
        };
        let users = parse_users(users).map_err(|err| anyhow!("--{ARG_BASIC_USERS}: {err}"))?;

        Ok(Some(Self {
            broker: matches
                .get_one::<String>(ARG_BASIC_BROKER)
                .cloned()
                .unwrap_or_else(|| "basic".to_string()),
            realm: matches
                .get_one::<String>(ARG_BASIC_REALM)
                .cloned()
                .unwrap_or_else(|| DEFAULT_REALM.to_string()),
            users,
        }))
    }
}
