mod constants;
mod status;

pub mod events;

pub use constants::*;
pub use events::{GAME_END, MATCH_FOUND, MatchResult, OPPONENT_DICE_ROLL, OPPONENT_MOVE, USER_DISCONNECTED};
pub use status::{JoinStatus, MatchStatus};
