//! Durable tier: a partitioned, clustering-key ordered store with no
//! transactions across partition keys. Every record type is a row in one
//! logical table keyed by `pk` (partition) and `sk` (clustering key).

pub mod dynamodb;
pub mod memory;
pub mod models;
pub mod partition_keys;

use anyhow::Result;
use async_trait::async_trait;

pub use dynamodb::DynamoDatabase;
pub use memory::MemoryDatabase;
use models::Item;

#[async_trait]
pub trait Database: Send + Sync {
    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<Item>>;

    /// Inserts or fully replaces the row at `(item.pk, item.sk)`
    async fn put_item(&self, item: Item) -> Result<()>;

    /// Deleting a missing row is not an error
    async fn delete_item(&self, pk: &str, sk: &str) -> Result<()>;

    /// Rows of one partition in ascending clustering-key order, optionally
    /// restricted to clustering keys starting with `sk_prefix`.
    async fn query_partition(
        &self,
        pk: &str,
        sk_prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Item>>;

    /// Non-indexed scan over every partition whose key starts with `pk_prefix`.
    /// Expensive; callers cap it with `limit` and must treat the result as approximate.
    async fn scan_all(&self, pk_prefix: &str, limit: usize) -> Result<Vec<Item>>;
}
