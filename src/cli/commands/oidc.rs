use crate::auth::oidc::{parse_claim_mapping, OidcConfig};
use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

pub const ARG_OIDC_ISSUER: &str = "oidc-issuer";
pub const ARG_OIDC_CLIENT_ID: &str = "oidc-client-id";
pub const ARG_OIDC_CLIENT_SECRET: &str = "oidc-client-secret";
pub const ARG_OIDC_BROKER: &str = "oidc-broker";
pub const ARG_OIDC_SCOPES: &str = "oidc-scopes";
pub const ARG_OIDC_OFFLINE_ACCESS: &str = "oidc-offline-access";
pub const ARG_OIDC_STATE_LIFETIME_SECONDS: &str = "oidc-state-lifetime-seconds";
pub const ARG_OIDC_END_SESSION: &str = "oidc-end-session";
pub const ARG_OIDC_ID_TOKEN_CLAIMS: &str = "oidc-id-token-claims";
pub const ARG_OIDC_ACCESS_TOKEN_CLAIMS: &str = "oidc-access-token-claims";
pub const ARG_OIDC_AUTH_PARAMS: &str = "oidc-auth-params";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OIDC_ISSUER)
                .long(ARG_OIDC_ISSUER)
                .help("OpenID Connect issuer URL; enables the OIDC broker")
                .env("AUTHBROKER_OIDC_ISSUER")
                .requires_all([ARG_OIDC_CLIENT_ID, ARG_OIDC_CLIENT_SECRET]),
        )
        .arg(
            Arg::new(ARG_OIDC_CLIENT_ID)
                .long(ARG_OIDC_CLIENT_ID)
                .help("OAuth2 client id")
                .env("AUTHBROKER_OIDC_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_OIDC_CLIENT_SECRET)
                .long(ARG_OIDC_CLIENT_SECRET)
                .help("OAuth2 client secret")
                .env("AUTHBROKER_OIDC_CLIENT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_OIDC_BROKER)
                .long(ARG_OIDC_BROKER)
                .help("Broker name used in /auth/login/<broker> and session keys")
                .env("AUTHBROKER_OIDC_BROKER")
                .default_value("oidc"),
        )
        .arg(
            Arg::new(ARG_OIDC_SCOPES)
                .long(ARG_OIDC_SCOPES)
                .help("Comma separated scopes requested in addition to openid")
                .env("AUTHBROKER_OIDC_SCOPES")
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_OIDC_OFFLINE_ACCESS)
                .long(ARG_OIDC_OFFLINE_ACCESS)
                .help("Request offline_access to receive refresh tokens")
                .env("AUTHBROKER_OIDC_OFFLINE_ACCESS")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_OIDC_STATE_LIFETIME_SECONDS)
                .long(ARG_OIDC_STATE_LIFETIME_SECONDS)
                .help("Seconds a pending login state stays valid")
                .env("AUTHBROKER_OIDC_STATE_LIFETIME_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_OIDC_END_SESSION)
                .long(ARG_OIDC_END_SESSION)
                .help("Redirect to the provider's end_session_endpoint on logout")
                .env("AUTHBROKER_OIDC_END_SESSION")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_OIDC_ID_TOKEN_CLAIMS)
                .long(ARG_OIDC_ID_TOKEN_CLAIMS)
                .help("Identity attributes from ID token claims, e.g. email=email,name=preferred_username")
                .env("AUTHBROKER_OIDC_ID_TOKEN_CLAIMS"),
        )
        .arg(
            Arg::new(ARG_OIDC_ACCESS_TOKEN_CLAIMS)
                .long(ARG_OIDC_ACCESS_TOKEN_CLAIMS)
                .help("Identity attributes from access token claims, e.g. roles=realm_roles")
                .env("AUTHBROKER_OIDC_ACCESS_TOKEN_CLAIMS"),
        )
        .arg(
            Arg::new(ARG_OIDC_AUTH_PARAMS)
                .long(ARG_OIDC_AUTH_PARAMS)
                .help("Extra authorization request parameters, e.g. prompt=login")
                .env("AUTHBROKER_OIDC_AUTH_PARAMS"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub config: OidcConfig,
}

impl Options {
    /// `None` unless an issuer is configured.
    ///
    /// # Errors
    /// Returns an error if a companion argument is missing or a mapping is malformed.
    pub fn parse(matches: &ArgMatches) -> Result<Option<Self>> {
        let Some(issuer) = matches.get_one::<String>(ARG_OIDC_ISSUER).cloned() else {
            return Ok(None);
        };
        let client_id = matches
            .get_one::<String>(ARG_OIDC_CLIENT_ID)
            .cloned()
            .context("missing required argument: --oidc-client-id")?;
        let client_secret = matches
            .get_one::<String>(ARG_OIDC_CLIENT_SECRET)
            .cloned()
            .map(SecretString::from)
            .context("missing required argument: --oidc-client-secret")?;

        let broker = matches
            .get_one::<String>(ARG_OIDC_BROKER)
            .cloned()
            .unwrap_or_else(|| "oidc".to_string());
        let scopes: Vec<String> = matches
            .get_many::<String>(ARG_OIDC_SCOPES)
            .map(|values| {
                values
                    .map(|scope| scope.trim().to_string())
                    .filter(|scope| !scope.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let state_lifetime = matches
            .get_one::<u64>(ARG_OIDC_STATE_LIFETIME_SECONDS)
            .copied()
            .unwrap_or(1800);

        let mapping = |arg: &str| {
            matches
                .get_one::<String>(arg)
                .map(|value| parse_claim_mapping(value).map_err(|err| anyhow!("--{arg}: {err}")))
                .transpose()
                .map(Option::unwrap_or_default)
        };
        let auth_params = mapping(ARG_OIDC_AUTH_PARAMS)?.into_iter().collect();

        let config = OidcConfig::new(broker)
            .with_scopes(scopes)
            .with_offline_access(matches.get_flag(ARG_OIDC_OFFLINE_ACCESS))
            .with_state_lifetime(Duration::from_secs(state_lifetime))
            .with_end_session(matches.get_flag(ARG_OIDC_END_SESSION))
            .with_id_token_claims(mapping(ARG_OIDC_ID_TOKEN_CLAIMS)?)
            .with_access_token_claims(mapping(ARG_OIDC_ACCESS_TOKEN_CLAIMS)?)
            .with_auth_params(auth_params);

        Ok(Some(Self {
            issuer,
            client_id,
            client_secret,
            config,
        }))
    }
}
