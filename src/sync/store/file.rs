//! One file per record under a directory.
//!
//! Subjects and session ids are form-urlencoded into file names so they cannot
//! escape the directory.

use super::{
    decode_ids, hash_key, session_ids_key, session_key, superseded, SessionTerminator, Store,
    StoreError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

pub struct FileStore {
    dir: PathBuf,
    sessions: Option<Arc<dyn SessionTerminator>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Use `dir` for records, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            sessions: None,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Also drop superseded sessions from a session engine that does not
    /// keep its data in `session_<id>` files of this directory.
    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionTerminator>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        let encoded: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
        self.dir.join(encoded)
    }

    async fn user_lock(&self, subject: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(subject.to_string())
            .or_default()
            .clone()
    }

    /// Forget the subject's lock once no other task holds or waits on it.
    async fn release_lock(&self, subject: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // one reference in the map, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(subject);
        }
    }

    async fn append(
        &self,
        subject: &str,
        hash: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let ids_key = session_ids_key(subject);
        let mut ids = decode_ids(self.read(&ids_key).await?.as_deref())?;
        ids.push(session_id.to_string());

        self.write(&hash_key(subject), hash).await?;
        self.write(&ids_key, &serde_json::to_string(&ids)?).await
    }

    async fn destroy(&self, subject: &str, current: &str) -> Result<(), StoreError> {
        let ids_key = session_ids_key(subject);
        let ids = decode_ids(self.read(&ids_key).await?.as_deref())?;
        for id in superseded(&ids, current) {
            self.remove(&session_key(id)).await?;
            if let Some(sessions) = &self.sessions {
                sessions.terminate(id).await;
            }
        }
        self.remove(&ids_key).await?;
        debug!(subject, sessions = ids.len(), "destroyed superseded sessions");
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(name)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, name: &str, contents: &str) -> Result<(), StoreError> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(self.path(name)).await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Store for FileStore {
    async fn set_hash_and_session_id_for_user(
        &self,
        subject: &str,
        hash: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let lock = self.user_lock(subject).await;
        let result = {
            let _guard = lock.lock().await;
            self.append(subject, hash, session_id).await
        };
        self.release_lock(subject, lock).await;
        result
    }

    async fn get_hash_by_user(&self, subject: &str) -> Result<Option<String>, StoreError> {
        self.read(&hash_key(subject)).await
    }

    async fn destroy_sessions_for_user(
        &self,
        subject: &str,
        current: &str,
    ) -> Result<(), StoreError> {
        let lock = self.user_lock(subject).await;
        let result = {
            let _guard = lock.lock().await;
            self.destroy(subject, current).await
        };
        self.release_lock(subject, lock).await;
        result
    }
}
