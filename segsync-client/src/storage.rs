//! Durable session token storage
//!
//! The client remembers one thing across process restarts: the token of the
//! session it last joined. It is read once when a connection opens, written
//! after every successful join and erased on leave or server-side deletion.
//!
//! Two backends are provided:
//! - [`SledSessionStore`]: an embedded sled database on disk
//! - [`MemorySessionStore`]: process-local, for tests and throwaway clients

use async_trait::async_trait;
use segsync_core::{Error, Result};
use std::path::Path;
use std::sync::Mutex;

/// Key under which the session token is stored
pub const SESSION_KEY: &str = "seg_session_id";

/// Storage for the current session token
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read the stored token, if any
    async fn load(&self) -> Result<Option<String>>;

    /// Persist a token, replacing any previous one
    async fn save(&self, token: &str) -> Result<()>;

    /// Erase the stored token
    async fn clear(&self) -> Result<()>;
}

/// Session store backed by sled
pub struct SledSessionStore {
    db: sled::Db,
}

impl SledSessionStore {
    /// Open (or create) a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open sled database: {}", e)))?;
        Ok(Self { db })
    }

    /// Use an already-open database
    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SledSessionStore {
    async fn load(&self) -> Result<Option<String>> {
        let value = self
            .db
            .get(SESSION_KEY)
            .map_err(|e| Error::Storage(format!("Failed to read session token: {}", e)))?;

        match value {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| Error::Storage(format!("Stored session token is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    async fn save(&self, token: &str) -> Result<()> {
        self.db
            .insert(SESSION_KEY, token.as_bytes())
            .map_err(|e| Error::Storage(format!("Failed to write session token: {}", e)))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| Error::Storage(format!("Failed to flush session token: {}", e)))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.db
            .remove(SESSION_KEY)
            .map_err(|e| Error::Storage(format!("Failed to erase session token: {}", e)))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| Error::Storage(format!("Failed to flush after erase: {}", e)))?;
        Ok(())
    }
}

/// Session store that lives only as long as the process
#[derive(Default)]
pub struct MemorySessionStore {
    token: Mutex<Option<String>>,
}

impl MemorySessionStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>> {
        self.token
            .lock()
            .map_err(|_| Error::Storage("session store lock poisoned".into()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.slot()?.clone())
    }

    async fn save(&self, token: &str) -> Result<()> {
        *self.slot()? = Some(token.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot()? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sled_store_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SledSessionStore::open(temp_dir.path().join("session.db")).unwrap();

        assert_eq!(store.load().await.unwrap(), None);

        store.save("ABC123").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("ABC123"));

        store.save("XYZ").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("XYZ"));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sled_store_shares_db() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = sled::open(temp_dir.path().join("shared.db")).unwrap();

        let writer = SledSessionStore::from_db(db.clone());
        let reader = SledSessionStore::from_db(db);

        writer.save("persisted").await.unwrap();
        assert_eq!(reader.load().await.unwrap().as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::with_token("seed");
        assert_eq!(store.load().await.unwrap().as_deref(), Some("seed"));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);

        store.save("next").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("next"));
    }
}
