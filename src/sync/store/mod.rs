//! Backends for the session synchronizer.
//!
//! Every backend keeps two records per user: the current hash
//! (`user_hash_<subject>`) and the JSON list of session ids issued since the
//! last rotation (`user_hashes_<subject>`).
//!
//! Superseded sessions are dropped through a [`SessionTerminator`] so the
//! session engine and the hash records never have to share storage.

pub mod file;
pub mod kv;
pub mod memory;
pub mod noop;

use crate::session::MemorySessionStore;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Overwrite the user's hash and append `session_id` to the user's id list.
    async fn set_hash_and_session_id_for_user(
        &self,
        subject: &str,
        hash: &str,
        session_id: &str,
    ) -> Result<(), StoreError>;

    async fn get_hash_by_user(&self, subject: &str) -> Result<Option<String>, StoreError>;

    /// Destroy every session listed for the user except `current`, then forget
    /// the list.
    async fn destroy_sessions_for_user(
        &self,
        subject: &str,
        current: &str,
    ) -> Result<(), StoreError>;

    /// `false` turns single-session enforcement off.
    fn enforces(&self) -> bool {
        true
    }
}

/// Drops sessions from the engine that issued them.
#[async_trait]
pub trait SessionTerminator: Send + Sync {
    /// Returns `false` when the session did not exist.
    async fn terminate(&self, session_id: &str) -> bool;
}

#[async_trait]
impl SessionTerminator for MemorySessionStore {
    async fn terminate(&self, session_id: &str) -> bool {
        self.destroy(session_id).await
    }
}

/// Ids to destroy: everything listed except the session being logged in.
pub(crate) fn superseded<'a>(
    ids: &'a [String],
    current: &'a str,
) -> impl Iterator<Item = &'a String> {
    ids.iter().filter(move |id| id.as_str() != current)
}

pub(crate) fn hash_key(subject: &str) -> String {
    format!("user_hash_{subject}")
}

pub(crate) fn session_ids_key(subject: &str) -> String {
    format!("user_hashes_{subject}")
}

pub(crate) fn session_key(session_id: &str) -> String {
    format!("session_{session_id}")
}

/// Decode a stored id list; a missing record is an empty list.
pub(crate) fn decode_ids(raw: Option<&str>) -> Result<Vec<String>, StoreError> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(Vec::new()),
    }
}
