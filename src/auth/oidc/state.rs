//! Pending login states kept in the browser session.
//!
//! Every `authenticate` appends a fresh token; a callback consumes the entry
//! matching its `state` query parameter. Entries older than the lifetime are
//! pruned and never match, so a replayed, forged or expired state all look the
//! same to the caller.

use crate::auth::AuthError;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const DEFAULT_STATE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync + Debug {
    fn now_unix(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingState {
    pub token: String,
    pub created_at: i64,
}

#[derive(Clone, Debug)]
pub struct StateStore {
    key: String,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    #[must_use]
    pub fn new(broker: &str) -> Self {
        Self {
            key: format!("auth.oidc.{broker}.states"),
            lifetime: DEFAULT_STATE_LIFETIME,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.key
    }

    fn is_live(&self, entry: &PendingState, now: i64) -> bool {
        let lifetime = i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX);
        now.saturating_sub(entry.created_at) <= lifetime
    }

    /// Append a new state token without touching other pending entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending list cannot be encoded into the session.
    pub async fn issue(&self, session: &Session) -> Result<String, AuthError> {
        let token = Uuid::new_v4().to_string();
        let entry = PendingState {
            token: token.clone(),
            created_at: self.clock.now_unix(),
        };

        session
            .modify(|values| {
                let mut pending = decode(values.get(&self.key));
                pending.push(entry);
                values.insert(self.key.clone(), serde_json::to_value(&pending)?);
                Ok::<_, serde_json::Error>(())
            })
            .await?;

        Ok(token)
    }

    /// Remove the live entry matching `token`.
    ///
    /// Expired entries are dropped on the way; the remaining ones stay usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending list cannot be encoded into the session.
    pub async fn consume(&self, session: &Session, token: &str) -> Result<bool, AuthError> {
        let now = self.clock.now_unix();

        let matched = session
            .modify(|values| {
                let pending = decode(values.get(&self.key));
                let mut matched = false;
                let remaining: Vec<PendingState> = pending
                    .into_iter()
                    .filter(|entry| self.is_live(entry, now))
                    .filter(|entry| {
                        if !matched && entry.token == token {
                            matched = true;
                            false
                        } else {
                            true
                        }
                    })
                    .collect();

                if remaining.is_empty() {
                    values.remove(&self.key);
                } else {
                    values.insert(self.key.clone(), serde_json::to_value(&remaining)?);
                }
                Ok::<_, serde_json::Error>(matched)
            })
            .await?;

        Ok(matched)
    }

    pub async fn pending(&self, session: &Session) -> Vec<PendingState> {
        session.modify(|values| decode(values.get(&self.key))).await
    }
}

fn decode(value: Option<&Value>) -> Vec<PendingState> {
    value
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Debug)]
    pub(crate) struct ManualClock(AtomicI64);

    impl ManualClock {
        pub(crate) fn new(now: i64) -> Self {
            Self(AtomicI64::new(now))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let secs = i64::try_from(by.as_secs()).unwrap_or(i64::MAX);
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_unix(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn store(clock: &Arc<ManualClock>) -> StateStore {
        StateStore::new("oidc").with_clock(clock.clone())
    }

    #[tokio::test]
    async fn parallel_states_are_each_valid_once() -> Result<(), AuthError> {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store = store(&clock);
        let session = Session::new("s1");

        let first = store.issue(&session).await?;
        let second = store.issue(&session).await?;
        assert_ne!(first, second);
        assert_eq!(store.pending(&session).await.len(), 2);

        assert!(!store.consume(&session, "forged").await?);
        assert!(store.consume(&session, &second).await?);
        assert!(store.consume(&session, &first).await?);
        assert!(!store.consume(&session, &first).await?);
        assert!(!store.consume(&session, &second).await?);
        assert!(!session.contains(store.session_key()).await);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_issue_keeps_every_token() -> Result<(), AuthError> {
        let store = Arc::new(StateStore::new("oidc"));
        let session = Arc::new(Session::new("s1"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let session = session.clone();
            handles.push(tokio::spawn(async move { store.issue(&session).await }));
        }
        let mut tokens = HashSet::new();
        for handle in handles {
            let token = handle
                .await
                .map_err(|err| AuthError::Upstream(err.to_string()))??;
            tokens.insert(token);
        }
        assert_eq!(tokens.len(), 16);

        for token in &tokens {
            assert!(store.consume(&session, token).await?);
        }
        for token in &tokens {
            assert!(!store.consume(&session, token).await?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn expired_state_is_rejected_with_default_lifetime() -> Result<(), AuthError> {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store = store(&clock);
        let session = Session::new("s1");

        let token = store.issue(&session).await?;
        clock.advance(Duration::from_secs(35 * 60));
        assert!(!store.consume(&session, &token).await?);
        assert!(store.pending(&session).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn custom_lifetime_accepts_older_state() -> Result<(), AuthError> {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store = store(&clock).with_lifetime(Duration::from_secs(60 * 60));
        let session = Session::new("s1");

        let token = store.issue(&session).await?;
        clock.advance(Duration::from_secs(35 * 60));
        assert!(store.consume(&session, &token).await?);
        Ok(())
    }

    #[tokio::test]
    async fn consume_prunes_expired_and_keeps_live_entries() -> Result<(), AuthError> {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store = store(&clock);
        let session = Session::new("s1");

        let old = store.issue(&session).await?;
        clock.advance(Duration::from_secs(20 * 60));
        let fresh = store.issue(&session).await?;
        let other = store.issue(&session).await?;
        clock.advance(Duration::from_secs(15 * 60));

        assert!(store.consume(&session, &fresh).await?);
        let pending = store.pending(&session).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].token, other);
        assert!(!store.consume(&session, &old).await?);
        Ok(())
    }

    #[tokio::test]
    async fn states_are_scoped_per_broker() -> Result<(), AuthError> {
        let session = Session::new("s1");
        let first = StateStore::new("first");
        let second = StateStore::new("second");

        let token = first.issue(&session).await?;
        assert!(!second.consume(&session, &token).await?);
        assert!(first.consume(&session, &token).await?);
        Ok(())
    }
}
