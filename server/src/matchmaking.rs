use anyhow::Context;
use chrono::{DateTime, Utc};
use common::{MATCH_FOUND, MatchResult, MatchStatus, PLAYERS_PER_MATCH};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::db::models::{MatchPair, PendingEntry};
use crate::db::partition_keys::join_day;
use crate::dice::DiceService;
use crate::error::MatchmakingError;
use crate::game_pieces::GamePieces;
use crate::matchmaking_manager::MatchmakingManager;
use crate::player_connections::Notifier;

/// Approximate counters for monitoring; never used for pairing decisions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchmakingStats {
    pub pending_entries: usize,
    pub active_matches: usize,
    pub expired_matches: usize,
    pub leagues: usize,
    pub generated_at: DateTime<Utc>,
}

/// Pairs waiting players per contest queue and stands up their match
pub struct MatchmakingEngine {
    manager: MatchmakingManager,
    pieces: GamePieces,
    dice: DiceService,
    notifier: Option<Arc<dyn Notifier>>,
    league_ids: Vec<String>,
}

impl MatchmakingEngine {
    pub fn new(db: Arc<dyn Database>, league_ids: Vec<String>) -> Self {
        Self::with_manager(MatchmakingManager::new(db), league_ids)
    }

    pub fn with_manager(manager: MatchmakingManager, league_ids: Vec<String>) -> Self {
        let db = manager.database().clone();
        Self {
            pieces: GamePieces::new(db.clone()),
            dice: DiceService::new(db),
            manager,
            notifier: None,
            league_ids,
        }
    }

    /// Players are told about their match through `notifier` once it exists
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn manager(&self) -> &MatchmakingManager {
        &self.manager
    }

    pub fn league_ids(&self) -> &[String] {
        &self.league_ids
    }

    /// One pass over every configured queue. A failing queue is logged and
    /// the pass moves on to the next one.
    pub async fn process_matchmaking(&self) -> Vec<MatchResult> {
        let mut results = Vec::new();

        for league_id in &self.league_ids {
            match self.pair_queue(league_id).await {
                Ok(Some(result)) => {
                    info!(
                        match_id = %result.match_id,
                        league_id = %result.league_id,
                        user1_id = %result.user1_id,
                        user2_id = %result.user2_id,
                        "Created match"
                    );
                    self.notify_match(&result).await;
                    results.push(result);
                }
                Ok(None) => {
                    trace!(league_id = %league_id, "No opponent available");
                }
                Err(e) => {
                    error!(league_id = %league_id, error = %e, "Matchmaking error");
                }
            }
        }

        results
    }

    /// Pairs the two earliest entries of today's queue for `league_id`, if there are two.
    pub async fn pair_queue(&self, league_id: &str) -> Result<Option<MatchResult>, MatchmakingError> {
        let day = join_day(&Utc::now());
        let entries = self
            .manager
            .pending_entries(league_id, &day, PLAYERS_PER_MATCH)
            .await?;

        let [first, second] = entries.as_slice() else {
            return Ok(None);
        };

        if first.user_id == second.user_id {
            // Leftover of a supersede that did not finish; retire the older entry
            warn!(user_id = %first.user_id, league_id, "Two live entries for one user, superseding the older");
            self.manager.supersede(first).await?;
            return Ok(None);
        }

        self.create_match(first, second).await.map(Some)
    }

    /// Stands up a match between two pending entries. The earlier joiner gets turn 1.
    pub async fn create_match(
        &self,
        a: &PendingEntry,
        b: &PendingEntry,
    ) -> Result<MatchResult, MatchmakingError> {
        let (first, second) = if b.joined_at < a.joined_at { (b, a) } else { (a, b) };
        let now = Utc::now();
        let match_id = Uuid::new_v4().to_string();

        // 1. The match pair itself; nothing else is written if this fails
        let pair = MatchPair {
            match_id: match_id.clone(),
            user1_id: first.user_id.clone(),
            user2_id: second.user_id.clone(),
            league_id: first.league_id.clone(),
            status: MatchStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.manager.put_match_pair(&pair).await?;

        let seats = [(first, second, 1u8), (second, first, 2u8)];
        let mut recorded = [true, true];

        // 2. Opponent fields in the ledger
        for (i, (entry, opponent, turn_id)) in seats.iter().enumerate() {
            if let Err(e) = self.manager.record_opponent(entry, opponent, &match_id, *turn_id).await {
                error!(user_id = %entry.user_id, match_id = %match_id, error = %e, "Failed to record opponent in ledger");
                recorded[i] = false;
            }
        }

        // 3. The same fields mirrored on the queue rows
        for (i, (entry, opponent, turn_id)) in seats.iter().enumerate() {
            if let Err(e) = self
                .manager
                .record_queue_opponent(entry, opponent, &match_id, *turn_id)
                .await
            {
                error!(user_id = %entry.user_id, match_id = %match_id, error = %e, "Failed to record opponent in queue");
                recorded[i] = false;
            }
        }

        // 4. Leave the queue, but only once the pairing is durable for that user
        for (i, (entry, _, _)) in seats.iter().enumerate() {
            if !recorded[i] {
                warn!(user_id = %entry.user_id, match_id = %match_id, "Keeping queue entry visible after failed pairing write");
                continue;
            }
            if let Err(e) = self.manager.remove_pending(entry).await {
                error!(user_id = %entry.user_id, match_id = %match_id, error = %e, "Failed to remove pending entry");
            }
        }

        // 5. Per-match state for both players
        for (entry, _, _) in seats.iter() {
            if let Err(e) = self.pieces.create_pieces_for_match(&match_id, &entry.user_id).await {
                error!(user_id = %entry.user_id, match_id = %match_id, error = %e, "Failed to create pieces");
            }
            if let Err(e) = self.dice.ensure_lookup(&match_id, &entry.user_id).await {
                error!(user_id = %entry.user_id, match_id = %match_id, error = %e, "Failed to create dice lookup");
            }
        }

        Ok(MatchResult {
            user1_id: first.user_id.clone(),
            user2_id: second.user_id.clone(),
            league_id: first.league_id.clone(),
            match_id,
            created_at: now,
        })
    }

    async fn notify_match(&self, result: &MatchResult) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        for (user_id, opponent_id, turn_id) in [
            (&result.user1_id, &result.user2_id, 1),
            (&result.user2_id, &result.user1_id, 2),
        ] {
            let payload = json!({
                "match_id": result.match_id,
                "league_id": result.league_id,
                "opponent_user_id": opponent_id,
                "turn_id": turn_id,
            });
            if let Err(e) = notifier.send_to_user(user_id, MATCH_FOUND, payload).await {
                debug!(user_id = %user_id, error = %e, "Match notification not delivered");
            }
        }
    }

    pub async fn matchmaking_stats(&self) -> Result<MatchmakingStats, MatchmakingError> {
        let pending_entries = self.manager.count_pending().await?;
        let pairs = self.manager.scan_match_pairs().await?;
        let active_matches = pairs.iter().filter(|p| p.status == MatchStatus::Active).count();

        Ok(MatchmakingStats {
            pending_entries,
            active_matches,
            expired_matches: pairs.len() - active_matches,
            leagues: self.league_ids.len(),
            generated_at: Utc::now(),
        })
    }

    /// Flips active match pairs older than `max_age` to expired. Rows are never deleted.
    pub async fn cleanup_expired_matches(&self, max_age: Duration) -> Result<usize, MatchmakingError> {
        let max_age = chrono::Duration::from_std(max_age).context("Match max age out of range")?;
        let cutoff = Utc::now() - max_age;
        let mut expired = 0;

        for mut pair in self.manager.scan_match_pairs().await? {
            if pair.status != MatchStatus::Active || pair.created_at > cutoff {
                continue;
            }
            pair.status = MatchStatus::Expired;
            pair.updated_at = Utc::now();
            match self.manager.put_match_pair(&pair).await {
                Ok(()) => expired += 1,
                Err(e) => error!(match_id = %pair.match_id, error = %e, "Failed to expire match"),
            }
        }

        if expired > 0 {
            info!(expired, "Expired old matches");
        }
        Ok(expired)
    }
}
