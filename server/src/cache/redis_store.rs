use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::info;

use super::CacheStore;
use crate::redis_utils::create_connection_manager;

const SCAN_BATCH: usize = 200;

const RENEW_IF_OWNER: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("pexpire", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = create_connection_manager(client).await?;
        info!("Connected to Redis cache tier");
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Escapes glob metacharacters so a key prefix can be used in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .clone()
            .get::<_, Option<String>>(key)
            .await
            .with_context(|| format!("Failed to get {} from Redis", key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.conn
            .clone()
            .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .with_context(|| format!("Failed to set {} in Redis", key))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.conn
            .clone()
            .del::<_, ()>(key)
            .await
            .with_context(|| format!("Failed to delete {} from Redis", key))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", glob_escape(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("Failed to scan Redis keys matching {}", pattern))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result: Option<String> = self
            .conn
            .clone()
            .set_options(
                key,
                value,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(ttl.as_millis() as u64)),
            )
            .await
            .context("Failed to execute SET NX command")?;
        Ok(result.is_some())
    }

    async fn renew_if_owner(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i32 = Script::new(RENEW_IF_OWNER)
            .key(key)
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .context("Failed to execute lease renewal script")?;
        Ok(result == 1)
    }
}
