use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use common::{JoinStatus, MatchStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::partition_keys::{META, PartitionKeys, join_day, join_month};

/// One row of the single-table layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub pk: String,
    pub sk: String,
    /// Expiry as unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    pub data: JsonValue,
}

impl Item {
    pub fn from_record<T: Serialize>(pk: String, sk: String, record: &T) -> Result<Self> {
        let data = serde_json::to_value(record).context("Failed to serialize record")?;
        if !data.is_object() {
            return Err(anyhow!("Record for {}/{} is not a JSON object", pk, sk));
        }
        Ok(Self { pk, sk, ttl: None, data })
    }

    pub fn with_ttl(mut self, expires_at: &DateTime<Utc>) -> Self {
        self.ttl = Some(expires_at.timestamp());
        self
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .with_context(|| format!("Failed to decode row {}/{}", self.pk, self.sk))
    }
}

// === Matchmaking ===

/// Durable ledger of a user's queue membership and eventual pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueJoinRecord {
    pub entry_id: String,
    pub user_id: String,
    pub league_id: String,
    pub status_id: JoinStatus,
    /// "pending" until paired, then "matched"
    pub status: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub opponent_user_id: Option<String>,
    pub opponent_league_id: Option<String>,
    pub match_pair_id: Option<String>,
    pub turn_id: Option<u8>,
    pub extra_data: Option<JsonValue>,
    pub updated_at: DateTime<Utc>,
}

impl LeagueJoinRecord {
    pub fn partition_key(&self) -> String {
        PartitionKeys::league_join(&self.user_id, self.status_id, &join_month(&self.joined_at))
    }

    pub fn sort_key(&self) -> String {
        PartitionKeys::league_join_sort(&self.league_id, &self.joined_at, &self.entry_id)
    }

    pub fn to_item(&self) -> Result<Item> {
        Item::from_record(self.partition_key(), self.sort_key(), self)
    }
}

/// A player waiting in one contest queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub entry_id: String,
    pub user_id: String,
    pub league_id: String,
    pub status_id: JoinStatus,
    pub joined_at: DateTime<Utc>,
    pub opponent_user_id: Option<String>,
    pub opponent_league_id: Option<String>,
    pub match_pair_id: Option<String>,
    pub turn_id: Option<u8>,
}

impl PendingEntry {
    pub fn partition_key(&self) -> String {
        PartitionKeys::pending(self.status_id, &join_day(&self.joined_at), &self.league_id)
    }

    pub fn sort_key(&self) -> String {
        PartitionKeys::pending_sort(&self.joined_at, &self.entry_id)
    }

    pub fn to_item(&self) -> Result<Item> {
        Item::from_record(self.partition_key(), self.sort_key(), self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    pub match_id: String,
    pub user1_id: String,
    pub user2_id: String,
    pub league_id: String,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MatchPair {
    pub fn to_item(&self) -> Result<Item> {
        Item::from_record(PartitionKeys::match_pair(&self.match_id), META.to_string(), self)
    }

    pub fn opponent_of(&self, user_id: &str) -> Option<&str> {
        if self.user1_id == user_id {
            Some(&self.user2_id)
        } else if self.user2_id == user_id {
            Some(&self.user1_id)
        } else {
            None
        }
    }
}

// === Sessions ===

/// The durable projection of a session: enough to rehydrate it, nothing mutable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_token: String,
    pub mobile_no: String,
    pub user_id: String,
    pub device_id: String,
    pub fcm_token: String,
    pub jwt_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl SessionRow {
    pub fn to_item(&self) -> Result<Item> {
        Ok(Item::from_record(PartitionKeys::session(&self.session_token), META.to_string(), self)?
            .with_ttl(&self.expires_at))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketMapping {
    pub socket_id: String,
    pub session_token: String,
    pub user_id: String,
    pub mobile_no: String,
    pub created_at: DateTime<Utc>,
}

impl SocketMapping {
    pub fn to_item(&self, expires_at: &DateTime<Utc>) -> Result<Item> {
        Ok(Item::from_record(PartitionKeys::socket(&self.socket_id), META.to_string(), self)?
            .with_ttl(expires_at))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileSessionIndex {
    pub mobile_no: String,
    pub session_token: String,
    pub created_at: DateTime<Utc>,
}

impl MobileSessionIndex {
    pub fn to_item(&self, expires_at: &DateTime<Utc>) -> Result<Item> {
        Ok(Item::from_record(
            PartitionKeys::mobile_sessions(&self.mobile_no),
            self.session_token.clone(),
            self,
        )?
        .with_ttl(expires_at))
    }
}

// === Game State ===

/// Lightweight mirror of a piece's latest move, kept for crash recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecePointer {
    pub game_id: String,
    pub user_id: String,
    pub piece_id: String,
    pub player_id: String,
    pub move_number: u32,
    pub from_position: String,
    pub to_position: String,
    pub piece_type: String,
    pub captured_piece: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PiecePointer {
    pub fn to_item(&self) -> Result<Item> {
        Item::from_record(
            PartitionKeys::piece_pointers(&self.game_id, &self.user_id),
            PartitionKeys::piece_pointer_sort(&self.piece_id),
            self,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEntry {
    pub move_number: u32,
    pub from_position: String,
    pub to_position: String,
    pub position_number: String,
    pub captured_piece: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceState {
    pub position: String,
    pub position_number: String,
    pub status: String,
    pub moves: u32,
    pub last_move_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceMetadata {
    pub created_by: String,
    pub game_type: String,
    pub piece_value: u32,
    pub current_position_number: String,
    pub total_positions: u32,
}

/// Consolidated per-piece move record written when a game ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceMoveRecord {
    pub game_id: String,
    pub user_id: String,
    pub piece_id: String,
    pub player_id: String,
    pub piece_type: String,
    pub total_moves: u32,
    pub last_position: String,
    pub last_move_time: DateTime<Utc>,
    pub current_state: PieceState,
    pub move_history: Vec<MoveEntry>,
    pub metadata: PieceMetadata,
    pub flushed_at: DateTime<Utc>,
}

impl PieceMoveRecord {
    pub fn to_item(&self) -> Result<Item> {
        Item::from_record(
            PartitionKeys::piece_moves(&self.game_id, &self.user_id),
            self.piece_id.clone(),
            self,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiceLookup {
    pub lookup_id: String,
    pub game_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl DiceLookup {
    pub fn to_item(&self) -> Result<Item> {
        Item::from_record(
            PartitionKeys::dice_lookup(&self.game_id, &self.user_id),
            META.to_string(),
            self,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub roll_id: String,
    pub lookup_id: String,
    pub game_id: String,
    pub user_id: String,
    pub value: u8,
    pub rolled_at: DateTime<Utc>,
}

impl DiceRoll {
    pub fn to_item(&self) -> Result<Item> {
        Item::from_record(
            PartitionKeys::dice_rolls(&self.lookup_id),
            PartitionKeys::dice_roll_sort(&self.rolled_at, &self.roll_id),
            self,
        )
    }
}
