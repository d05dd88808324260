//! Cache tier: low-latency key/value store with per-key TTLs and prefix
//! enumeration. Sessions and move buffers live here while they are hot.

pub mod memory;
pub mod redis_store;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryCache;
pub use redis_store::RedisCache;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Full-value overwrite with a time to live
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Every live key starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Sets `key` only if it does not exist. Returns true when the value was written.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Extends the TTL of `key` only while it still holds `value`.
    async fn renew_if_owner(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
}
