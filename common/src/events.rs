use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound event names delivered to clients by the transport layer
pub const MATCH_FOUND: &str = "match:found";
pub const OPPONENT_MOVE: &str = "opponent:move";
pub const OPPONENT_DICE_ROLL: &str = "opponent:dice:roll";
pub const GAME_END: &str = "game:end";
pub const USER_DISCONNECTED: &str = "user:disconnected";

/// Outcome of pairing two pending entries. `user1_id` joined first and moves first.
/// The match id is also the game id used by pieces, dice and the move buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub user1_id: String,
    pub user2_id: String,
    pub league_id: String,
    pub match_id: String,
    pub created_at: DateTime<Utc>,
}

impl MatchResult {
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
