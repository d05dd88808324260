use chrono::{DateTime, Datelike, Utc};
use common::JoinStatus;

/// Clustering key of single-row partitions
pub const META: &str = "META";

/// Fixed-width UTC timestamp; lexical order equals chronological order.
pub fn timestamp_key(at: &DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S%6f").to_string()
}

/// Day bucket of the pending queue
pub fn join_day(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Month bucket of the league join ledger
pub fn join_month(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// The month of `at` followed by the `lookback` months before it.
pub fn recent_months(at: &DateTime<Utc>, lookback: u32) -> Vec<String> {
    let current = at.year() * 12 + at.month0() as i32;
    (0..=lookback as i32)
        .map(|back| {
            let index = current - back;
            format!("{:04}-{:02}", index.div_euclid(12), index.rem_euclid(12) + 1)
        })
        .collect()
}

pub struct PartitionKeys;

impl PartitionKeys {
    // === Matchmaking ===

    /// League join ledger partition; the status is part of the key
    pub fn league_join(user_id: &str, status: JoinStatus, month: &str) -> String {
        format!("LEAGUE_JOIN#{}#{}#{}", user_id, status, month)
    }

    pub fn league_join_sort(league_id: &str, joined_at: &DateTime<Utc>, entry_id: &str) -> String {
        format!("{}#{}#{}", league_id, timestamp_key(joined_at), entry_id)
    }

    pub fn league_join_sort_prefix(league_id: &str) -> String {
        format!("{}#", league_id)
    }

    /// Pending queue partition for one league on one day
    pub fn pending(status: JoinStatus, day: &str, league_id: &str) -> String {
        format!("PENDING#{}#{}#{}", status, day, league_id)
    }

    pub fn pending_sort(joined_at: &DateTime<Utc>, entry_id: &str) -> String {
        format!("{}#{}", timestamp_key(joined_at), entry_id)
    }

    pub fn pending_scan_prefix(status: JoinStatus) -> String {
        format!("PENDING#{}#", status)
    }

    pub fn match_pair(match_id: &str) -> String {
        format!("MATCH#{}", match_id)
    }

    pub const MATCH_SCAN_PREFIX: &'static str = "MATCH#";

    // === Sessions ===

    pub fn session(session_token: &str) -> String {
        format!("SESSION#{}", session_token)
    }

    pub const SESSION_SCAN_PREFIX: &'static str = "SESSION#";

    pub fn socket(socket_id: &str) -> String {
        format!("SOCKET#{}", socket_id)
    }

    pub fn mobile_sessions(mobile_no: &str) -> String {
        format!("SESSIONS_BY_MOBILE#{}", mobile_no)
    }

    // === Game State ===

    /// Current piece pointers of one player in a game
    pub fn piece_pointers(game_id: &str, user_id: &str) -> String {
        format!("PIECES#{}#{}", game_id, user_id)
    }

    /// Pointer rows always sit at move number 0
    pub fn piece_pointer_sort(piece_id: &str) -> String {
        format!("0#{}", piece_id)
    }

    pub const PIECE_POINTER_PREFIX: &'static str = "0#";

    /// Consolidated move records flushed at game end
    pub fn piece_moves(game_id: &str, user_id: &str) -> String {
        format!("PIECE_MOVES#{}#{}", game_id, user_id)
    }

    pub fn dice_lookup(game_id: &str, user_id: &str) -> String {
        format!("DICE_LOOKUP#{}#{}", game_id, user_id)
    }

    pub fn dice_rolls(lookup_id: &str) -> String {
        format!("DICE_ROLLS#{}", lookup_id)
    }

    pub fn dice_roll_sort(rolled_at: &DateTime<Utc>, roll_id: &str) -> String {
        format!("{}#{}", timestamp_key(rolled_at), roll_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_keys_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2024, 9, 30, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        assert!(timestamp_key(&earlier) < timestamp_key(&later));
        assert_eq!(timestamp_key(&earlier).len(), timestamp_key(&later).len());
    }

    #[test]
    fn test_recent_months_crosses_year_boundary() {
        let at = Utc.with_ymd_and_hms(2025, 2, 14, 12, 0, 0).unwrap();
        assert_eq!(recent_months(&at, 2), vec!["2025-02", "2025-01", "2024-12"]);
        assert_eq!(join_month(&at), "2025-02");
        assert_eq!(join_day(&at), "2025-02-14");
    }

    #[test]
    fn test_status_is_part_of_partition_key() {
        let pending = PartitionKeys::league_join("u1", JoinStatus::Pending, "2025-02");
        let superseded = PartitionKeys::league_join("u1", JoinStatus::Superseded, "2025-02");
        assert_eq!(pending, "LEAGUE_JOIN#u1#1#2025-02");
        assert_ne!(pending, superseded);
        assert!(PartitionKeys::pending(JoinStatus::Pending, "2025-02-14", "3")
            .starts_with(&PartitionKeys::pending_scan_prefix(JoinStatus::Pending)));
    }
}
