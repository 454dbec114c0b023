//! Key/value backend with per-record expiry.
//!
//! Records are written with a TTL equal to the configured max age, so a user
//! who never logs in again ages out on its own. The max age should match the
//! session lifetime: a hash that expires first logs its session out.

use super::{
    decode_ids, hash_key, session_ids_key, session_key, superseded, SessionTerminator, Store,
    StoreError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(20 * 60);

/// Minimal command set of a key/value engine with expiring keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn del(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// Process-local engine; expired keys read as missing and are dropped lazily.
#[derive(Default)]
pub struct InMemoryKeyValue {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryKeyValue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

pub struct KeyValueSyncStore {
    engine: Arc<dyn KeyValueStore>,
    sessions: Option<Arc<dyn SessionTerminator>>,
    max_age: Duration,
    lock: Mutex<()>,
}

impl KeyValueSyncStore {
    #[must_use]
    pub fn new(engine: Arc<dyn KeyValueStore>) -> Self {
        Self {
            engine,
            sessions: None,
            max_age: DEFAULT_MAX_AGE,
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Also drop superseded sessions from a session engine that does not
    /// keep its data in `session_<id>` keys of this engine.
    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionTerminator>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

#[async_trait]
impl Store for KeyValueSyncStore {
    async fn set_hash_and_session_id_for_user(
        &self,
        subject: &str,
        hash: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let ids_key = session_ids_key(subject);
        let mut ids = decode_ids(self.engine.get(&ids_key).await?.as_deref())?;
        ids.push(session_id.to_string());

        self.engine
            .set_ex(&hash_key(subject), hash, self.max_age)
            .await?;
        self.engine
            .set_ex(&ids_key, &serde_json::to_string(&ids)?, self.max_age)
            .await
    }

    async fn get_hash_by_user(&self, subject: &str) -> Result<Option<String>, StoreError> {
        self.engine.get(&hash_key(subject)).await
    }

    async fn destroy_sessions_for_user(
        &self,
        subject: &str,
        current: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let ids_key = session_ids_key(subject);
        let ids = decode_ids(self.engine.get(&ids_key).await?.as_deref())?;

        let mut keys: Vec<String> = superseded(&ids, current)
            .map(|id| session_key(id))
            .collect();
        if let Some(sessions) = &self.sessions {
            for id in superseded(&ids, current) {
                if sessions.terminate(id).await {
                    debug!(subject, "destroyed superseded session");
                }
            }
        }
        keys.push(ids_key);
        self.engine.del(&keys).await
    }
}
