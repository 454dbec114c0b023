//! Single active session per user.
//!
//! A login rotates the user's hash in a [`Store`] and copies it into the
//! session under a per-broker key. A session whose copy no longer matches has
//! been superseded by a later login and is treated as logged out.

pub mod store;

use crate::auth::{AuthError, Identity};
use crate::session::Session;
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub use self::store::{Store, StoreError};

/// Session key holding the hash of the login made through `broker`.
#[must_use]
pub fn session_hash_key(broker: &str) -> String {
    format!("auth.sync.{broker}.hash")
}

#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Make `session` the only active session of `identity`.
    async fn insert(&self, identity: &Identity, session: &Session) -> Result<(), AuthError>;

    /// Whether `session` still carries the user's current hash for the
    /// identity's broker.
    async fn is_active(&self, identity: &Identity, session: &Session) -> Result<bool, AuthError>;

    /// Drop the session-local hash of `broker` on explicit logout.
    async fn clear(&self, broker: &str, session: &Session);
}

pub struct SessionSynchronizer {
    store: Arc<dyn Store>,
}

impl SessionSynchronizer {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

/// `base64url(SHA-256(subject || unix nanos || session id))`.
fn session_hash(subject: &str, session_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());

    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(nanos.to_string().as_bytes());
    hasher.update(session_id.as_bytes());
    Base64UrlUnpadded::encode_string(&hasher.finalize())
}

#[async_trait]
impl Synchronizer for SessionSynchronizer {
    async fn insert(&self, identity: &Identity, session: &Session) -> Result<(), AuthError> {
        if !self.store.enforces() {
            return Ok(());
        }
        let subject = identity.subject();

        if let Err(err) = self
            .store
            .destroy_sessions_for_user(subject, session.id())
            .await
        {
            warn!(subject, "failed to destroy previous sessions: {err}");
        }

        let hash = session_hash(subject, session.id());
        self.store
            .set_hash_and_session_id_for_user(subject, &hash, session.id())
            .await?;
        session
            .insert(&session_hash_key(identity.broker()), &hash)
            .await?;
        debug!(subject, "session hash rotated");
        Ok(())
    }

    async fn is_active(&self, identity: &Identity, session: &Session) -> Result<bool, AuthError> {
        if !self.store.enforces() {
            return Ok(true);
        }
        let key = session_hash_key(identity.broker());
        let Some(local) = session.get::<String>(&key).await else {
            return Ok(false);
        };
        let current = self.store.get_hash_by_user(identity.subject()).await?;
        Ok(current.is_some_and(|current| current == local))
    }

    async fn clear(&self, broker: &str, session: &Session) {
        session.remove(&session_hash_key(broker)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::store::memory::MemoryStore;
    use super::store::noop::NoopStore;
    use super::*;
    use crate::session::MemorySessionStore;

    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn set_hash_and_session_id_for_user(
            &self,
            _subject: &str,
            _hash: &str,
            _session_id: &str,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }

        async fn get_hash_by_user(&self, _subject: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }

        async fn destroy_sessions_for_user(
            &self,
            _subject: &str,
            _current: &str,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
    }

    fn memory_sync() -> (SessionSynchronizer, Arc<MemoryStore>, Arc<MemorySessionStore>) {
        let sessions = Arc::new(MemorySessionStore::default());
        let store = Arc::new(MemoryStore::new(sessions.clone()));
        (SessionSynchronizer::new(store.clone()), store, sessions)
    }

    #[tokio::test]
    async fn later_login_supersedes_earlier_session() -> Result<(), AuthError> {
        let (sync, _, _) = memory_sync();
        let alice = Identity::new("alice", "oidc");
        let first = Session::new("a");
        let second = Session::new("b");

        sync.insert(&alice, &first).await?;
        assert!(sync.is_active(&alice, &first).await?);

        sync.insert(&alice, &second).await?;
        assert!(!sync.is_active(&alice, &first).await?);
        assert!(sync.is_active(&alice, &second).await?);
        Ok(())
    }

    #[tokio::test]
    async fn login_destroys_previous_sessions() -> Result<(), Box<dyn std::error::Error>> {
        let (sync, store, sessions) = memory_sync();
        let alice = Identity::new("alice", "oidc");

        let first = sessions.create().await?;
        sync.insert(&alice, &first).await?;
        assert_eq!(store.session_ids("alice").await?, [first.id()]);

        let second = sessions.create().await?;
        sync.insert(&alice, &second).await?;
        assert_eq!(store.session_ids("alice").await?, [second.id()]);

        assert!(sessions.load(first.id()).await.is_none());
        assert!(sessions.load(second.id()).await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn first_login_records_one_session() -> Result<(), Box<dyn std::error::Error>> {
        let (sync, store, _) = memory_sync();
        let alice = Identity::new("alice", "oidc");
        let session = Session::new("a");

        sync.insert(&alice, &session).await?;
        assert_eq!(store.session_ids("alice").await?, ["a"]);
        let stored = store.get_hash_by_user("alice").await?;
        let local = session.get::<String>(&session_hash_key("oidc")).await;
        assert!(stored.is_some());
        assert_eq!(stored, local);
        Ok(())
    }

    #[tokio::test]
    async fn relogin_keeps_the_current_session() -> Result<(), Box<dyn std::error::Error>> {
        let (sync, store, sessions) = memory_sync();
        let alice = Identity::new("alice", "oidc");
        let session = sessions.create().await?;

        sync.insert(&alice, &session).await?;
        sync.insert(&alice, &session).await?;
        assert!(sessions.load(session.id()).await.is_some());
        assert!(sync.is_active(&alice, &session).await?);
        assert_eq!(store.session_ids("alice").await?, [session.id()]);
        Ok(())
    }

    #[tokio::test]
    async fn hashes_are_kept_per_broker() -> Result<(), AuthError> {
        let (sync, _, _) = memory_sync();
        let alice = Identity::new("alice", "corp");
        let bob = Identity::new("bob", "dev");
        let session = Session::new("a");

        sync.insert(&alice, &session).await?;
        sync.insert(&bob, &session).await?;
        assert!(sync.is_active(&alice, &session).await?);
        assert!(sync.is_active(&bob, &session).await?);

        sync.clear("dev", &session).await;
        assert!(sync.is_active(&alice, &session).await?);
        assert!(!sync.is_active(&bob, &session).await?);
        Ok(())
    }

    #[tokio::test]
    async fn users_are_independent() -> Result<(), AuthError> {
        let (sync, _, _) = memory_sync();
        let alice = Identity::new("alice", "oidc");
        let bob = Identity::new("bob", "oidc");
        let a = Session::new("a");
        let b = Session::new("b");

        sync.insert(&alice, &a).await?;
        sync.insert(&bob, &b).await?;
        assert!(sync.is_active(&alice, &a).await?);
        assert!(sync.is_active(&bob, &b).await?);
        assert!(!sync.is_active(&bob, &a).await?);
        Ok(())
    }

    #[tokio::test]
    async fn missing_hashes_are_inactive() -> Result<(), AuthError> {
        let (sync, _, _) = memory_sync();
        let alice = Identity::new("alice", "oidc");
        let session = Session::new("a");
        assert!(!sync.is_active(&alice, &session).await?);

        session.insert(&session_hash_key("oidc"), "stale").await?;
        assert!(!sync.is_active(&alice, &session).await?);
        Ok(())
    }

    #[tokio::test]
    async fn clear_deactivates_the_session() -> Result<(), AuthError> {
        let (sync, _, _) = memory_sync();
        let alice = Identity::new("alice", "oidc");
        let session = Session::new("a");

        sync.insert(&alice, &session).await?;
        sync.clear("oidc", &session).await;
        assert!(!sync.is_active(&alice, &session).await?);
        Ok(())
    }

    #[tokio::test]
    async fn noop_store_never_enforces() -> Result<(), AuthError> {
        let sync = SessionSynchronizer::new(Arc::new(NoopStore));
        let alice = Identity::new("alice", "oidc");
        let session = Session::new("a");

        assert!(sync.is_active(&alice, &session).await?);
        sync.insert(&alice, &session).await?;
        assert!(!session.contains(&session_hash_key("oidc")).await);
        assert!(sync.is_active(&alice, &session).await?);
        Ok(())
    }

    #[tokio::test]
    async fn backend_errors_are_store_unavailable() -> Result<(), AuthError> {
        let sync = SessionSynchronizer::new(Arc::new(BrokenStore));
        let alice = Identity::new("alice", "oidc");
        let session = Session::new("a");

        let insert = sync.insert(&alice, &session).await;
        assert!(matches!(insert, Err(AuthError::StoreUnavailable(_))));

        session.insert(&session_hash_key("oidc"), "h").await?;
        let active = sync.is_active(&alice, &session).await;
        assert!(matches!(active, Err(AuthError::StoreUnavailable(_))));
        Ok(())
    }

    #[test]
    fn hash_keys_are_prefixed_by_broker() {
        assert_eq!(session_hash_key("corp"), "auth.sync.corp.hash");
        assert_ne!(session_hash_key("a"), session_hash_key("b"));
    }

    #[test]
    fn hashes_differ_per_session() {
        assert_ne!(session_hash("alice", "a"), session_hash("alice", "b"));
        assert_eq!(session_hash("alice", "a").len(), 43);
    }
}
