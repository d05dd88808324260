use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::CacheStore;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process cache tier honouring TTLs. Used by tests and local runs.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().await.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew_if_owner(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == value => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set_ex("a", "1", Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.scan_prefix("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_prefix_is_sorted_and_scoped() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set_ex("piece_moves:g1:u1:piece_2", "{}", ttl).await.unwrap();
        cache.set_ex("piece_moves:g1:u1:piece_1", "{}", ttl).await.unwrap();
        cache.set_ex("piece_moves:g2:u1:piece_1", "{}", ttl).await.unwrap();

        let keys = cache.scan_prefix("piece_moves:g1:").await.unwrap();
        assert_eq!(
            keys,
            vec!["piece_moves:g1:u1:piece_1", "piece_moves:g1:u1:piece_2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_primitives() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_millis(500);

        assert!(cache.set_nx_px("lease", "a", ttl).await.unwrap());
        assert!(!cache.set_nx_px("lease", "b", ttl).await.unwrap());
        assert!(cache.renew_if_owner("lease", "a", ttl).await.unwrap());
        assert!(!cache.renew_if_owner("lease", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!cache.renew_if_owner("lease", "a", ttl).await.unwrap());
        assert!(cache.set_nx_px("lease", "b", ttl).await.unwrap());
    }
}
