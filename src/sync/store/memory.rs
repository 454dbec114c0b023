use super::{
    decode_ids, hash_key, session_ids_key, superseded, SessionTerminator, Store, StoreError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-process records; superseded sessions are destroyed through the session
/// engine's [`SessionTerminator`].
pub struct MemoryStore {
    records: RwLock<HashMap<String, String>>,
    sessions: Arc<dyn SessionTerminator>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionTerminator>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sessions,
        }
    }

    /// Session ids listed for the user.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored list is not valid JSON.
    pub async fn session_ids(&self, subject: &str) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        decode_ids(records.get(&session_ids_key(subject)).map(String::as_str))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_hash_and_session_id_for_user(
        &self,
        subject: &str,
        hash: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let ids_key = session_ids_key(subject);
        let mut ids = decode_ids(records.get(&ids_key).map(String::as_str))?;
        ids.push(session_id.to_string());

        records.insert(ids_key, serde_json::to_string(&ids)?);
        records.insert(hash_key(subject), hash.to_string());
        Ok(())
    }

    async fn get_hash_by_user(&self, subject: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records.read().await.get(&hash_key(subject)).cloned())
    }

    async fn destroy_sessions_for_user(
        &self,
        subject: &str,
        current: &str,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let ids_key = session_ids_key(subject);
        let ids = decode_ids(records.get(&ids_key).map(String::as_str))?;

        for id in superseded(&ids, current) {
            if self.sessions.terminate(id).await {
                debug!(subject, "destroyed superseded session");
            }
        }
        records.remove(&ids_key);
        Ok(())
    }
}
