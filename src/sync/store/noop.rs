use super::{Store, StoreError};
use async_trait::async_trait;

/// Disables single-session enforcement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl Store for NoopStore {
    async fn set_hash_and_session_id_for_user(
        &self,
        _subject: &str,
        _hash: &str,
        _session_id: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_hash_by_user(&self, _subject: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn destroy_sessions_for_user(
        &self,
        _subject: &str,
        _current: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn enforces(&self) -> bool {
        false
    }
}
