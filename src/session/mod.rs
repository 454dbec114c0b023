//! Cookie-bound server-side sessions.
//!
//! A [`Session`] is a string-keyed bag of JSON values guarded by its own lock.
//! Brokers prefix their keys with their name so several brokers can share one
//! session without collisions.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 12 * 60 * 60;

#[derive(Debug)]
pub struct Session {
    id: String,
    values: Mutex<HashMap<String, Value>>,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read and decode a value. Values that no longer decode are treated as missing.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.lock().await;
        let value = values.get(key)?.clone();
        drop(values);
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                debug!("session {} key {key} does not decode: {err}", self.id);
                None
            }
        }
    }

    /// Encode and store a value.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be represented as JSON.
    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.values.lock().await.remove(key)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.values.lock().await.contains_key(key)
    }

    /// Run `f` with exclusive access to every value of the session.
    ///
    /// Read-modify-write sequences (pending states, redirect lists) go through
    /// here so two requests sharing the session cannot interleave.
    pub async fn modify<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<String, Value>) -> R,
    {
        let mut values = self.values.lock().await;
        f(&mut values)
    }
}

/// Create a random session id for the session cookie.
///
/// # Errors
///
/// Returns an error if the operating system RNG fails.
pub fn generate_session_id() -> Result<String, rand::Error> {
    let mut bytes = [0u8; 32];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

struct SessionEntry {
    session: Arc<Session>,
    last_seen: Instant,
}

/// Process-local session store with idle expiry.
pub struct MemorySessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_SESSION_TTL_SECONDS))
    }
}

impl MemorySessionStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Load a live session and refresh its idle timer.
    pub async fn load(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(id)?;
        if entry.last_seen.elapsed() >= self.ttl {
            sessions.remove(id);
            return None;
        }
        entry.last_seen = Instant::now();
        Some(entry.session.clone())
    }

    /// Create and register a new empty session.
    ///
    /// # Errors
    ///
    /// Returns an error if no session id can be generated.
    pub async fn create(&self) -> Result<Arc<Session>, rand::Error> {
        let session = Arc::new(Session::new(generate_session_id()?));
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, entry| entry.last_seen.elapsed() < self.ttl);
        sessions.insert(
            session.id().to_string(),
            SessionEntry {
                session: session.clone(),
                last_seen: Instant::now(),
            },
        );
        Ok(session)
    }

    /// Drop a session. Returns `false` when it did not exist.
    pub async fn destroy(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
