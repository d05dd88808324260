pub struct RedisKeys;

impl RedisKeys {
    // === Sessions ===

    /// Full session record, authoritative while the session is live
    pub fn session(session_token: &str) -> String {
        format!("session:{}", session_token)
    }

    // === Move Buffer ===

    /// Buffered move state for one piece
    pub fn piece_moves(game_id: &str, user_id: &str, piece_id: &str) -> String {
        format!("piece_moves:{}:{}:{}", game_id, user_id, piece_id)
    }

    /// Prefix matching every buffered piece of a game
    pub fn piece_moves_for_game(game_id: &str) -> String {
        format!("piece_moves:{}:", game_id)
    }

    /// Prefix matching every buffered piece of one player in a game
    pub fn piece_moves_for_user(game_id: &str, user_id: &str) -> String {
        format!("piece_moves:{}:{}:", game_id, user_id)
    }

    // === Cluster Singleton Keys ===

    /// Lease key for a singleton service
    pub fn singleton_lease(service_name: &str) -> String {
        format!("singleton:lease:{}", service_name)
    }

    /// Matchmaking singleton lease
    pub fn matchmaking_singleton_lease() -> String {
        Self::singleton_lease("matchmaking")
    }
}
