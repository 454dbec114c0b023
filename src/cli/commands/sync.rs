use crate::auth::StoreFailurePolicy;
use crate::sync::store::kv::DEFAULT_MAX_AGE;
use anyhow::{anyhow, Context, Result};
use clap::{builder::PossibleValuesParser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;

pub const ARG_SINGLE_SESSION: &str = "single-session";
pub const ARG_SYNC_BACKEND: &str = "sync-backend";
pub const ARG_SYNC_FILE_PATH: &str = "sync-file-path";
pub const ARG_SYNC_MAX_AGE_SECONDS: &str = "sync-max-age-seconds";
pub const ARG_SYNC_FAILURE_POLICY: &str = "sync-failure-policy";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SINGLE_SESSION)
                .long(ARG_SINGLE_SESSION)
                .help("Allow one active session per user; older sessions are logged out")
                .env("AUTHBROKER_SINGLE_SESSION")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_SYNC_BACKEND)
                .long(ARG_SYNC_BACKEND)
                .help("Session hash store")
                .env("AUTHBROKER_SYNC_BACKEND")
                .default_value("memory")
                .value_parser(PossibleValuesParser::new(["noop", "memory", "kv", "file"])),
        )
        .arg(
            Arg::new(ARG_SYNC_FILE_PATH)
                .long(ARG_SYNC_FILE_PATH)
                .help("Directory for the file backend")
                .env("AUTHBROKER_SYNC_FILE_PATH")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(ARG_SYNC_MAX_AGE_SECONDS)
                .long(ARG_SYNC_MAX_AGE_SECONDS)
                .help("Record TTL for the kv backend [default: the session TTL]")
                .env("AUTHBROKER_SYNC_MAX_AGE_SECONDS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SYNC_FAILURE_POLICY)
                .long(ARG_SYNC_FAILURE_POLICY)
                .help("Keep (open) or drop (closed) sessions when the store is unreachable")
                .env("AUTHBROKER_SYNC_FAILURE_POLICY")
                .default_value("open")
                .value_parser(PossibleValuesParser::new(["open", "closed"])),
        )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Noop,
    Memory,
    KeyValue { max_age: Duration },
    File { path: PathBuf },
}

#[derive(Debug)]
pub struct Options {
    pub backend: Backend,
    pub failure_policy: StoreFailurePolicy,
}

impl Options {
    /// `None` unless single-session enforcement is enabled.
    ///
    /// # Errors
    /// Returns an error if the file backend has no path.
    pub fn parse(matches: &ArgMatches) -> Result<Option<Self>> {
        if !matches.get_flag(ARG_SINGLE_SESSION) {
            return Ok(None);
        }

        let backend = match matches
            .get_one::<String>(ARG_SYNC_BACKEND)
            .map_or("memory", String::as_str)
        {
            "noop" => Backend::Noop,
            "kv" => Backend::KeyValue {
                max_age: kv_max_age(matches),
            },
            "file" => Backend::File {
                path: matches
                    .get_one::<PathBuf>(ARG_SYNC_FILE_PATH)
                    .cloned()
                    .context("missing required argument: --sync-file-path")?,
            },
            _ => Backend::Memory,
        };

        let failure_policy = matches
            .get_one::<String>(ARG_SYNC_FAILURE_POLICY)
            .map_or(Ok(StoreFailurePolicy::default()), |policy| policy.parse())
            .map_err(|err| anyhow!(err))?;

        Ok(Some(Self {
            backend,
            failure_policy,
        }))
    }
}

/// Explicit max age, else the session TTL so hashes outlive their sessions.
fn kv_max_age(matches: &ArgMatches) -> Duration {
    matches
        .get_one::<u64>(ARG_SYNC_MAX_AGE_SECONDS)
        .or_else(|| {
            matches
                .try_get_one::<u64>(super::ARG_SESSION_TTL_SECONDS)
                .ok()
                .flatten()
        })
        .copied()
        .map_or(DEFAULT_MAX_AGE, Duration::from_secs)
}
