use anyhow::Context;
use chrono::Utc;
use common::{DISCONNECT_MONTH_LOOKBACK, JoinStatus, STATS_SCAN_LIMIT};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::db::models::{Item, LeagueJoinRecord, MatchPair, PendingEntry};
use crate::db::partition_keys::{META, PartitionKeys, join_day, join_month, recent_months};
use crate::error::MatchmakingError;
use crate::transition::transition;

type Result<T> = std::result::Result<T, MatchmakingError>;

/// Durable access to the league join ledger, the pending queue and match pairs
#[derive(Clone)]
pub struct MatchmakingManager {
    db: Arc<dyn Database>,
    max_retries: u32,
    retry_delay: Duration,
}

impl MatchmakingManager {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Puts a user into a contest queue. A live entry the user already has in
    /// the same league is superseded first, so only the fresh entry can be paired.
    pub async fn join_contest(
        &self,
        user_id: &str,
        league_id: &str,
        extra_data: Option<JsonValue>,
    ) -> Result<PendingEntry> {
        let superseded = self
            .retire_live_entries(user_id, Some(league_id), 0, JoinStatus::Superseded)
            .await;
        if superseded > 0 {
            info!(user_id, league_id, superseded, "Superseded previous pending entries");
        }

        let now = Utc::now();
        let entry_id = Uuid::new_v4().to_string();
        let record = LeagueJoinRecord {
            entry_id: entry_id.clone(),
            user_id: user_id.to_string(),
            league_id: league_id.to_string(),
            status_id: JoinStatus::Pending,
            status: "pending".to_string(),
            role: "player".to_string(),
            joined_at: now,
            opponent_user_id: None,
            opponent_league_id: None,
            match_pair_id: None,
            turn_id: None,
            extra_data,
            updated_at: now,
        };
        let entry = PendingEntry {
            entry_id,
            user_id: user_id.to_string(),
            league_id: league_id.to_string(),
            status_id: JoinStatus::Pending,
            joined_at: now,
            opponent_user_id: None,
            opponent_league_id: None,
            match_pair_id: None,
            turn_id: None,
        };

        let mut attempts = 0;
        let mut delay = self.retry_delay;

        loop {
            attempts += 1;
            match self.insert_join(&record, &entry).await {
                Ok(()) => break,
                Err(e) if attempts < self.max_retries => {
                    warn!("Failed to join contest (attempt {}/{}): {:#}", attempts, self.max_retries, e);
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
                Err(e) => {
                    error!("Failed to join contest after {} attempts", self.max_retries);
                    return Err(MatchmakingError::MaxAttemptsExceeded {
                        attempts,
                        last_error: format!("{:#}", e),
                    });
                }
            }
        }

        info!(user_id, league_id, entry_id = %entry.entry_id, "User joined contest queue");
        Ok(entry)
    }

    async fn insert_join(&self, record: &LeagueJoinRecord, entry: &PendingEntry) -> anyhow::Result<()> {
        self.db.put_item(record.to_item()?).await?;
        self.db.put_item(entry.to_item()?).await?;
        Ok(())
    }

    /// Moves the user's live entries in one league to `Cancelled`.
    pub async fn cancel_search(&self, user_id: &str, league_id: &str) -> Result<usize> {
        let cancelled = self
            .retire_live_entries(user_id, Some(league_id), 0, JoinStatus::Cancelled)
            .await;
        info!(user_id, league_id, cancelled, "Cancelled contest search");
        Ok(cancelled)
    }

    /// Moves every live entry of the user, across the current and prior join
    /// months, to `Disconnected`. The session is left alone.
    pub async fn disconnect_user(&self, user_id: &str) -> Result<usize> {
        let moved = self
            .retire_live_entries(user_id, None, DISCONNECT_MONTH_LOOKBACK, JoinStatus::Disconnected)
            .await;
        info!(user_id, moved, "Moved live league joins to disconnected");
        Ok(moved)
    }

    /// Transitions live ledger rows and their queue rows to `to`. Failures on
    /// one row are logged and the remaining rows are still processed.
    async fn retire_live_entries(
        &self,
        user_id: &str,
        league_id: Option<&str>,
        month_lookback: u32,
        to: JoinStatus,
    ) -> usize {
        let mut moved = 0;

        for month in recent_months(&Utc::now(), month_lookback) {
            let records = match self.live_league_joins(user_id, &month, league_id).await {
                Ok(records) => records,
                Err(e) => {
                    error!(user_id, month = %month, error = %e, "Failed to read live league joins");
                    continue;
                }
            };

            for record in records {
                match self.retire(&record, to).await {
                    Ok(()) => moved += 1,
                    Err(e) => error!(
                        user_id,
                        entry_id = %record.entry_id,
                        to = %to,
                        error = %e,
                        "Failed to transition league join"
                    ),
                }
            }
        }

        moved
    }

    async fn retire(&self, record: &LeagueJoinRecord, to: JoinStatus) -> Result<()> {
        // Queue row first so the entry leaves pairing as early as possible
        if let Some(entry) = self.pending_for(record).await? {
            transition(self.db.as_ref(), &entry, to).await?;
        }
        transition(self.db.as_ref(), record, to).await?;
        Ok(())
    }

    /// The live queue row belonging to a ledger row, if it is still queued
    async fn pending_for(&self, record: &LeagueJoinRecord) -> Result<Option<PendingEntry>> {
        let pk = PartitionKeys::pending(JoinStatus::Pending, &join_day(&record.joined_at), &record.league_id);
        let sk = PartitionKeys::pending_sort(&record.joined_at, &record.entry_id);
        let item = self.db.get_item(&pk, &sk).await?;
        Ok(item.map(|item| item.parse()).transpose()?)
    }

    async fn live_league_joins(
        &self,
        user_id: &str,
        month: &str,
        league_id: Option<&str>,
    ) -> Result<Vec<LeagueJoinRecord>> {
        let pk = PartitionKeys::league_join(user_id, JoinStatus::Pending, month);
        let prefix = league_id.map(PartitionKeys::league_join_sort_prefix);
        let items = self.db.query_partition(&pk, prefix.as_deref(), None).await?;
        Ok(parse_rows(items))
    }

    /// Oldest-first entries of one league's queue for one day
    pub async fn pending_entries(&self, league_id: &str, day: &str, limit: usize) -> Result<Vec<PendingEntry>> {
        let pk = PartitionKeys::pending(JoinStatus::Pending, day, league_id);
        let items = self.db.query_partition(&pk, None, Some(limit)).await?;
        Ok(parse_rows(items))
    }

    pub async fn league_joins(
        &self,
        user_id: &str,
        status: JoinStatus,
        month: &str,
    ) -> Result<Vec<LeagueJoinRecord>> {
        let pk = PartitionKeys::league_join(user_id, status, month);
        let items = self.db.query_partition(&pk, None, None).await?;
        Ok(parse_rows(items))
    }

    /// Writes the pairing into the user's live ledger row.
    pub async fn record_opponent(
        &self,
        entry: &PendingEntry,
        opponent: &PendingEntry,
        match_id: &str,
        turn_id: u8,
    ) -> Result<()> {
        let pk = PartitionKeys::league_join(&entry.user_id, JoinStatus::Pending, &join_month(&entry.joined_at));
        let sk = PartitionKeys::league_join_sort(&entry.league_id, &entry.joined_at, &entry.entry_id);
        let mut record: LeagueJoinRecord = self
            .db
            .get_item(&pk, &sk)
            .await?
            .ok_or_else(|| MatchmakingError::LedgerRowMissing(entry.entry_id.clone()))?
            .parse()?;

        record.opponent_user_id = Some(opponent.user_id.clone());
        record.opponent_league_id = Some(opponent.league_id.clone());
        record.match_pair_id = Some(match_id.to_string());
        record.turn_id = Some(turn_id);
        record.status = "matched".to_string();
        record.updated_at = Utc::now();

        self.db.put_item(record.to_item()?).await?;
        debug!(user_id = %entry.user_id, match_id, turn_id, "Recorded opponent in ledger");
        Ok(())
    }

    /// Mirrors the pairing onto the queue row.
    pub async fn record_queue_opponent(
        &self,
        entry: &PendingEntry,
        opponent: &PendingEntry,
        match_id: &str,
        turn_id: u8,
    ) -> Result<()> {
        let mut updated = entry.clone();
        updated.opponent_user_id = Some(opponent.user_id.clone());
        updated.opponent_league_id = Some(opponent.league_id.clone());
        updated.match_pair_id = Some(match_id.to_string());
        updated.turn_id = Some(turn_id);
        self.db.put_item(updated.to_item()?).await?;
        Ok(())
    }

    pub async fn remove_pending(&self, entry: &PendingEntry) -> Result<()> {
        self.db
            .delete_item(&entry.partition_key(), &entry.sort_key())
            .await
            .with_context(|| format!("Failed to remove pending entry {}", entry.entry_id))?;
        Ok(())
    }

    /// Supersedes a single live entry (ledger and queue rows).
    pub async fn supersede(&self, entry: &PendingEntry) -> Result<()> {
        let pk = PartitionKeys::league_join(&entry.user_id, JoinStatus::Pending, &join_month(&entry.joined_at));
        let sk = PartitionKeys::league_join_sort(&entry.league_id, &entry.joined_at, &entry.entry_id);
        transition(self.db.as_ref(), entry, JoinStatus::Superseded).await?;
        if let Some(item) = self.db.get_item(&pk, &sk).await? {
            let record: LeagueJoinRecord = item.parse()?;
            transition(self.db.as_ref(), &record, JoinStatus::Superseded).await?;
        }
        Ok(())
    }

    pub async fn put_match_pair(&self, pair: &MatchPair) -> Result<()> {
        self.db.put_item(pair.to_item()?).await?;
        Ok(())
    }

    pub async fn match_pair(&self, match_id: &str) -> Result<Option<MatchPair>> {
        let item = self.db.get_item(&PartitionKeys::match_pair(match_id), META).await?;
        Ok(item.map(|item| item.parse()).transpose()?)
    }

    /// Approximate: capped full scan
    pub async fn scan_match_pairs(&self) -> Result<Vec<MatchPair>> {
        let items = self.db.scan_all(PartitionKeys::MATCH_SCAN_PREFIX, STATS_SCAN_LIMIT).await?;
        Ok(parse_rows(items))
    }

    /// Approximate: capped full scan over every live queue partition
    pub async fn count_pending(&self) -> Result<usize> {
        let prefix = PartitionKeys::pending_scan_prefix(JoinStatus::Pending);
        Ok(self.db.scan_all(&prefix, STATS_SCAN_LIMIT).await?.len())
    }
}

/// Decodes rows, skipping (and logging) any that no longer match the record shape
fn parse_rows<T: serde::de::DeserializeOwned>(items: Vec<Item>) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match item.parse() {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(pk = %item.pk, sk = %item.sk, error = %e, "Skipping undecodable row");
                None
            }
        })
        .collect()
}
