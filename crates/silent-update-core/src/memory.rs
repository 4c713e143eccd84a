use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::traits::KeyValueStore;

/// Process-local [`KeyValueStore`].
///
/// Useful as a secondary store when no second durable medium exists, and in
/// tests, where individual keys can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    failing_writes: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `set` on `key` fail with [`StorageError::QuotaExceeded`].
    pub fn fail_writes_to(&self, key: &str) {
        lock(&self.failing_writes).insert(key.to_string());
    }

    pub fn fail_reads_from(&self, key: &str) {
        lock(&self.failing_reads).insert(key.to_string());
    }

    pub fn heal(&self, key: &str) {
        lock(&self.failing_writes).remove(key);
        lock(&self.failing_reads).remove(key);
    }

    /// Store a value without any validation, e.g. to simulate corruption.
    pub fn insert_raw(&self, key: &str, value: &str) {
        lock(&self.entries).insert(key.to_string(), value.to_string());
    }

    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if lock(&self.failing_reads).contains(key) {
            return Err(StorageError::Unavailable(format!("reads of {key} disabled")));
        }
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if lock(&self.failing_writes).contains(key) {
            return Err(StorageError::QuotaExceeded);
        }
        self.insert_raw(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::error::StorageError;
    use crate::traits::KeyValueStore;

    #[tokio::test]
    async fn failing_key_does_not_affect_other_keys() {
        let store = MemoryStore::new();
        store.fail_writes_to("a");

        assert_eq!(store.set("a", "1").await, Err(StorageError::QuotaExceeded));
        store.set("b", "2").await.expect("other keys stay writable");
        assert_eq!(store.get("b").await, Ok(Some("2".to_string())));

        store.heal("a");
        store.set("a", "1").await.expect("healed key is writable");
        assert_eq!(store.raw("a").as_deref(), Some("1"));
    }
}
