use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::Database;
use super::models::Item;

/// In-process durable tier: partitions of clustering-key ordered rows.
#[derive(Default)]
pub struct MemoryDatabase {
    partitions: RwLock<BTreeMap<String, BTreeMap<String, Item>>>,
    fail_writes: AtomicBool,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent put/delete fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Total number of rows across all partitions
    pub async fn row_count(&self) -> usize {
        self.partitions.read().await.values().map(BTreeMap::len).sum()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("durable store rejected the write"));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<Item>> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(pk).and_then(|rows| rows.get(sk)).cloned())
    }

    async fn put_item(&self, item: Item) -> Result<()> {
        self.check_writable()?;
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(item.pk.clone())
            .or_default()
            .insert(item.sk.clone(), item);
        Ok(())
    }

    async fn delete_item(&self, pk: &str, sk: &str) -> Result<()> {
        self.check_writable()?;
        let mut partitions = self.partitions.write().await;
        if let Some(rows) = partitions.get_mut(pk) {
            rows.remove(sk);
            if rows.is_empty() {
                partitions.remove(pk);
            }
        }
        Ok(())
    }

    async fn query_partition(
        &self,
        pk: &str,
        sk_prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Item>> {
        let partitions = self.partitions.read().await;
        let Some(rows) = partitions.get(pk) else {
            return Ok(Vec::new());
        };
        let prefix = sk_prefix.unwrap_or("");
        Ok(rows
            .range(prefix.to_string()..)
            .take_while(|(sk, _)| sk.starts_with(prefix))
            .map(|(_, item)| item.clone())
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn scan_all(&self, pk_prefix: &str, limit: usize) -> Result<Vec<Item>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .range(pk_prefix.to_string()..)
            .take_while(|(pk, _)| pk.starts_with(pk_prefix))
            .flat_map(|(_, rows)| rows.values().cloned())
            .take(limit)
            .collect())
    }
}
