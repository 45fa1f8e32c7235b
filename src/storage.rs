//! Secure storage capability.
//!
//! The core persists sessions and prekeys through a host-provided store
//! with implementation-defined at-rest protection (OS keychain, encrypted
//! file). The only contract the core relies on is that `set` linearizes
//! before any subsequent `get` on the same key.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Host-provided persistent key/value store
///
/// Values are opaque UTF-8 strings; the core stores JSON. Keys use the
/// `signal:` prefix namespace.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Read a value, `None` when the key has never been set or was deleted
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value; visible to every subsequent `get`
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory storage for tests and ephemeral profiles
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Storage that fails every operation, for error-path tests
#[derive(Debug, Default)]
pub struct FailingStorage;

#[async_trait]
impl SecureStorage for FailingStorage {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::Storage("backend unavailable".into()))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(Error::Storage("backend unavailable".into()))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(Error::Storage("backend unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let storage = MemoryStorage::new();
        storage.set("signal:prekeys", "{\"a\":1}").await.unwrap();
        assert_eq!(
            storage.get("signal:prekeys").await.unwrap(),
            Some("{\"a\":1}".to_owned())
        );
    }

    #[tokio::test]
    async fn test_delete_removes() {
        let storage = MemoryStorage::new();
        storage.set("k", "v").await.unwrap();
        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_storage_surfaces_errors() {
        let storage = FailingStorage;
        assert!(matches!(storage.get("k").await, Err(Error::Storage(_))));
        assert!(matches!(storage.set("k", "v").await, Err(Error::Storage(_))));
    }
}
