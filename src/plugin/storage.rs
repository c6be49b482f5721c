//! Namespaced extension storage
//!
//! Every extension sees a private key space. Keys are stored as
//! `<extension id>::<key>` in one flat [`KvStore`], so two extensions writing
//! the same key never collide.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::error::{ExtensionError, Result};

const SEPARATOR: &str = "::";

/// Flat key-value backend shared by all extensions
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<bool>;
    /// All `(key, value)` pairs whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>>;
    async fn remove_prefix(&self, prefix: &str) -> Result<u64>;
}

/// In-process store used when no database is configured and in tests
#[derive(Debug, Default, Clone)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub key_count: u64,
}

/// One extension's view of the shared store.
///
/// Writes through one handle and its clones are serialized, so the quota
/// check and the write it guards see the same state.
#[derive(Clone)]
pub struct ExtensionStorage {
    namespace: String,
    store: Arc<dyn KvStore>,
    quota_bytes: u64,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ExtensionStorage {
    pub fn new(extension_id: &str, store: Arc<dyn KvStore>, quota_bytes: u64) -> Self {
        Self {
            namespace: format!("{}{}", extension_id, SEPARATOR),
            store,
            quota_bytes,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn full_key(&self, key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(ExtensionError::StorageError("storage key must not be empty".to_string()));
        }
        Ok(format!("{}{}", self.namespace, key))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.store.get(&self.full_key(key)?).await
    }

    pub async fn get_or_default(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Store a value; fails with `StorageError` when the namespace would exceed its quota
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        let full_key = self.full_key(key)?;
        let new_size = entry_size(key, &value);
        let _write = self.write_lock.lock().await;

        let mut used = 0u64;
        for (existing_key, existing) in self.store.scan_prefix(&self.namespace).await? {
            if existing_key != full_key {
                used += entry_size(&existing_key[self.namespace.len()..], &existing);
            }
        }

        if used + new_size > self.quota_bytes {
            return Err(ExtensionError::StorageError(format!(
                "storage quota exceeded: {} of {} bytes",
                used + new_size,
                self.quota_bytes
            )));
        }

        self.store.set(&full_key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key)?;
        let _write = self.write_lock.lock().await;
        self.store.remove(&full_key).await
    }

    pub async fn clear(&self) -> Result<u64> {
        let _write = self.write_lock.lock().await;
        self.store.remove_prefix(&self.namespace).await
    }

    /// Keys without the namespace prefix
    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .scan_prefix(&self.namespace)
            .await?
            .into_iter()
            .map(|(k, _)| k[self.namespace.len()..].to_string())
            .collect())
    }

    pub async fn usage(&self) -> Result<StorageUsage> {
        let entries = self.store.scan_prefix(&self.namespace).await?;
        let used_bytes = entries
            .iter()
            .map(|(k, v)| entry_size(&k[self.namespace.len()..], v))
            .sum();
        Ok(StorageUsage {
            used_bytes,
            quota_bytes: self.quota_bytes,
            key_count: entries.len() as u64,
        })
    }
}

fn entry_size(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage(id: &str, store: &Arc<dyn KvStore>, quota: u64) -> ExtensionStorage {
        ExtensionStorage::new(id, Arc::clone(store), quota)
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let a = storage("alpha", &store, 1024);
        let b = storage("beta", &store, 1024);

        a.set("token", json!("a-secret")).await.unwrap();
        b.set("token", json!("b-secret")).await.unwrap();

        assert_eq!(a.get("token").await.unwrap(), Some(json!("a-secret")));
        assert_eq!(b.get("token").await.unwrap(), Some(json!("b-secret")));

        a.clear().await.unwrap();
        assert_eq!(a.get("token").await.unwrap(), None);
        assert_eq!(b.get("token").await.unwrap(), Some(json!("b-secret")));
    }

    #[tokio::test]
    async fn test_prefix_is_not_shared_with_longer_ids() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let short = storage("ext", &store, 1024);
        let long = storage("ext2", &store, 1024);

        long.set("k", json!(1)).await.unwrap();
        assert!(short.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_or_default_and_keys() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let s = storage("alpha", &store, 1024);

        assert_eq!(s.get_or_default("page", json!(1)).await.unwrap(), json!(1));
        s.set("page", json!(4)).await.unwrap();
        s.set("query", json!("frieren")).await.unwrap();
        assert_eq!(s.get_or_default("page", json!(1)).await.unwrap(), json!(4));
        assert_eq!(s.keys().await.unwrap(), vec!["page".to_string(), "query".to_string()]);

        assert!(s.remove("page").await.unwrap());
        assert!(!s.remove("page").await.unwrap());
    }

    #[tokio::test]
    async fn test_quota() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let s = storage("alpha", &store, 16);

        s.set("k", json!("0123456789")).await.unwrap();
        let usage = s.usage().await.unwrap();
        assert_eq!(usage.used_bytes, 13);
        assert_eq!(usage.key_count, 1);

        // Overwriting the same key only counts the new value
        s.set("k", json!("abcdefghij")).await.unwrap();

        let err = s.set("other", json!("0123456789")).await.unwrap_err();
        assert!(matches!(err, ExtensionError::StorageError(_)));
    }

    /// Memory store that yields inside every scan, widening check-then-write races
    struct SlowScanStore(MemoryKvStore);

    #[async_trait]
    impl KvStore for SlowScanStore {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> Result<()> {
            self.0.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<bool> {
            self.0.remove(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
            let entries = self.0.scan_prefix(prefix).await?;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(entries)
        }

        async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
            self.0.remove_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_writes_respect_quota() {
        let store: Arc<dyn KvStore> = Arc::new(SlowScanStore(MemoryKvStore::new()));
        let s = storage("alpha", &store, 20);

        // Each entry is 13 bytes: one fits, two do not
        let s2 = s.clone();
        let (first, second) = tokio::join!(
            s.set("a", json!("0123456789")),
            s2.set("b", json!("0123456789")),
        );

        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        assert!(s.usage().await.unwrap().used_bytes <= 20);
    }
}
