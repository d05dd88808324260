//! Status transitions for rows whose partition key embeds a mutable status.
//!
//! Such rows are never updated in place. A transition writes the row under its
//! new status (only if that row is not already there) and then deletes the row
//! under the old status. The two steps are not atomic, so both rows can be
//! visible for a moment; re-running a half-finished transition completes it.

use anyhow::Result;
use chrono::Utc;
use common::JoinStatus;
use tracing::debug;

use crate::db::Database;
use crate::db::models::{Item, LeagueJoinRecord, PendingEntry};

pub trait StatusKeyed: Clone {
    fn status(&self) -> JoinStatus;
    fn set_status(&mut self, status: JoinStatus);
    fn partition_key(&self) -> String;
    fn sort_key(&self) -> String;
    fn to_item(&self) -> Result<Item>;
}

impl StatusKeyed for LeagueJoinRecord {
    fn status(&self) -> JoinStatus {
        self.status_id
    }

    fn set_status(&mut self, status: JoinStatus) {
        self.status_id = status;
        self.updated_at = Utc::now();
    }

    fn partition_key(&self) -> String {
        LeagueJoinRecord::partition_key(self)
    }

    fn sort_key(&self) -> String {
        LeagueJoinRecord::sort_key(self)
    }

    fn to_item(&self) -> Result<Item> {
        LeagueJoinRecord::to_item(self)
    }
}

impl StatusKeyed for PendingEntry {
    fn status(&self) -> JoinStatus {
        self.status_id
    }

    fn set_status(&mut self, status: JoinStatus) {
        self.status_id = status;
    }

    fn partition_key(&self) -> String {
        PendingEntry::partition_key(self)
    }

    fn sort_key(&self) -> String {
        PendingEntry::sort_key(self)
    }

    fn to_item(&self) -> Result<Item> {
        PendingEntry::to_item(self)
    }
}

/// Moves `record` to status `to` and returns the record as it now reads.
pub async fn transition<T: StatusKeyed>(db: &dyn Database, record: &T, to: JoinStatus) -> Result<T> {
    let from = record.status();
    if from == to {
        return Ok(record.clone());
    }

    let mut next = record.clone();
    next.set_status(to);

    let (next_pk, next_sk) = (next.partition_key(), next.sort_key());
    if db.get_item(&next_pk, &next_sk).await?.is_none() {
        db.put_item(next.to_item()?).await?;
    } else {
        debug!(pk = %next_pk, sk = %next_sk, "Target row already present, completing transition");
    }

    let (old_pk, old_sk) = (record.partition_key(), record.sort_key());
    if db.get_item(&old_pk, &old_sk).await?.is_some() {
        db.delete_item(&old_pk, &old_sk).await?;
    }

    debug!(from = %from, to = %to, pk = %next_pk, "Status transition complete");
    Ok(next)
}
