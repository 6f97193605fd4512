//! In-process cache store.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CacheError, CacheItem, ResponseCache};

/// Cache kept in memory for the lifetime of the value.
#[derive(Debug, Default)]
pub struct MemoryCache {
    items: DashMap<String, CacheItem>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheItem>, CacheError> {
        Ok(self.items.get(key).map(|item| item.value().clone()))
    }

    async fn set(&self, key: &str, item: &CacheItem) -> Result<(), CacheError> {
        self.items.insert(key.to_string(), item.clone());
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.items.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.items.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.items.clear();
        Ok(())
    }
}
