use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::Database;
use crate::db::models::{DiceLookup, DiceRoll};
use crate::db::partition_keys::{META, PartitionKeys};

const RECENT_ROLLS: usize = 5;

/// Summary of one player's rolls in one game
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiceStats {
    pub game_id: String,
    pub user_id: String,
    pub total_rolls: usize,
    pub average_roll: f64,
    pub highest_roll: u8,
    pub lowest_roll: u8,
    pub roll_counts: BTreeMap<u8, usize>,
    /// Newest first
    pub recent_rolls: Vec<DiceRoll>,
}

#[derive(Clone)]
pub struct DiceService {
    db: Arc<dyn Database>,
}

impl DiceService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Returns the player's roll lookup for a game, creating it on first use.
    pub async fn ensure_lookup(&self, game_id: &str, user_id: &str) -> Result<DiceLookup> {
        if let Some(lookup) = self.lookup(game_id, user_id).await? {
            return Ok(lookup);
        }

        let lookup = DiceLookup {
            lookup_id: Uuid::new_v4().to_string(),
            game_id: game_id.to_string(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
        };
        self.db.put_item(lookup.to_item()?).await?;
        info!(game_id, user_id, lookup_id = %lookup.lookup_id, "Created dice lookup");
        Ok(lookup)
    }

    pub async fn lookup(&self, game_id: &str, user_id: &str) -> Result<Option<DiceLookup>> {
        let item = self
            .db
            .get_item(&PartitionKeys::dice_lookup(game_id, user_id), META)
            .await?;
        item.map(|item| item.parse()).transpose()
    }

    pub async fn roll(&self, game_id: &str, user_id: &str) -> Result<DiceRoll> {
        let lookup = self.ensure_lookup(game_id, user_id).await?;
        let roll = DiceRoll {
            roll_id: Uuid::new_v4().to_string(),
            lookup_id: lookup.lookup_id,
            game_id: game_id.to_string(),
            user_id: user_id.to_string(),
            value: rand::thread_rng().gen_range(1..=6),
            rolled_at: Utc::now(),
        };
        self.db.put_item(roll.to_item()?).await?;
        debug!(game_id, user_id, value = roll.value, "Dice rolled");
        Ok(roll)
    }

    /// Rolls of one player in one game, oldest first
    pub async fn history(&self, game_id: &str, user_id: &str) -> Result<Vec<DiceRoll>> {
        let Some(lookup) = self.lookup(game_id, user_id).await? else {
            return Ok(Vec::new());
        };
        let items = self
            .db
            .query_partition(&PartitionKeys::dice_rolls(&lookup.lookup_id), None, None)
            .await?;
        items.iter().map(|item| item.parse()).collect()
    }

    /// A player without any rolls gets zeroed stats.
    pub async fn stats(&self, game_id: &str, user_id: &str) -> Result<DiceStats> {
        let history = self.history(game_id, user_id).await?;
        let mut stats = DiceStats {
            game_id: game_id.to_string(),
            user_id: user_id.to_string(),
            ..Default::default()
        };
        if history.is_empty() {
            return Ok(stats);
        }

        let mut sum = 0u32;
        stats.lowest_roll = u8::MAX;
        for roll in &history {
            sum += u32::from(roll.value);
            stats.highest_roll = stats.highest_roll.max(roll.value);
            stats.lowest_roll = stats.lowest_roll.min(roll.value);
            *stats.roll_counts.entry(roll.value).or_default() += 1;
        }
        stats.total_rolls = history.len();
        stats.average_roll = f64::from(sum) / history.len() as f64;
        stats.recent_rolls = history.into_iter().rev().take(RECENT_ROLLS).collect();
        Ok(stats)
    }
}
