use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use super::{CacheBackend, StoredResponse};
use crate::{CacheError, RequestKey};

type Entries = HashMap<RequestKey, StoredResponse>;

/// In-process backend.
///
/// An optional byte quota makes writes fail the way a full disk store
/// would, with [`CacheError::Unavailable`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    caches: RwLock<HashMap<String, Entries>>,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total body bytes held across all caches.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    fn used_bytes(caches: &HashMap<String, Entries>) -> usize {
        caches
            .values()
            .flat_map(|entries| entries.values())
            .map(|entry| entry.body.len())
            .sum()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        let mut caches = self.caches.write().await;

        if let Some(quota) = self.quota_bytes {
            let replaced = caches
                .get(name)
                .and_then(|entries| entries.get(&key))
                .map_or(0, |old| old.body.len());
            let projected = Self::used_bytes(&caches) - replaced + response.body.len();
            if projected > quota {
                return Err(CacheError::Unavailable(format!(
                    "quota exceeded: {projected} > {quota} bytes"
                )));
            }
        }

        caches
            .entry(name.to_string())
            .or_default()
            .insert(key, response);
        Ok(())
    }

    async fn remove(&self, name: &str, key: &RequestKey) -> Result<bool, CacheError> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(name)
            .is_some_and(|entries| entries.remove(key).is_some()))
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>, CacheError> {
        let mut keys: Vec<RequestKey> = self
            .caches
            .read()
            .await
            .get(name)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}
