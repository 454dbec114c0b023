//! # Authbroker (pluggable authentication broker orchestration)
//!
//! `authbroker` lets a web application register several identity brokers and
//! drive them uniformly from server-side sessions.
//!
//! ## Brokers
//!
//! Every broker answers "who is this request's user" (`identify`). Brokers that
//! support interactive login also expose `authenticate`, `callback` and
//! `logout`. Capabilities are discovered per call, so an HTTP Basic broker can
//! sit next to an OpenID Connect broker without implementing redirects.
//!
//! - **OpenID Connect:** authorization-code flow with per-session pending
//!   states. Several login attempts from the same browser may be in flight at
//!   once; each state is consumable exactly once and expires after 30 minutes
//!   by default.
//! - **HTTP Basic:** static `username -> password` map with a `401` challenge.
//! - **Static:** pick-a-user page for local environments and integration tests.
//!
//! ## Single active session
//!
//! When enabled, a successful login rotates the user's session hash in a
//! pluggable store (no-op, in-memory, key/value with TTL, file). Sessions
//! carrying an older hash are treated as logged out on their next request.

pub mod api;
pub mod auth;
pub mod cli;
pub mod events;
pub mod session;
pub mod sync;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
