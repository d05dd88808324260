/// Number of pieces each player owns in a match
pub const PIECES_PER_PLAYER: u32 = 4;

/// Buffered move history kept per piece while a match is live
pub const MOVE_HISTORY_LIMIT: usize = 10;

/// Number of squares a piece travels before reaching home
pub const TOTAL_BOARD_POSITIONS: u32 = 57;

/// Lifetime of a move buffer entry in the cache tier (bounds abandoned games)
pub const PIECE_BUFFER_TTL_SECS: u64 = 24 * 60 * 60;

/// Default session lifetime, used for both the cache TTL and `expires_at`
pub const SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Contest queues scanned by a matchmaking pass when none are configured
pub const DEFAULT_LEAGUE_COUNT: u32 = 10;

/// Entries read per queue per matchmaking pass
pub const PLAYERS_PER_MATCH: usize = 2;

/// Row cap for the approximate monitoring scans
pub const STATS_SCAN_LIMIT: usize = 10_000;

/// Join-months before the current one that the disconnect transition revisits
pub const DISCONNECT_MONTH_LOOKBACK: u32 = 2;

/// Default interval for cluster singleton renewal in milliseconds
pub const CLUSTER_RENEWAL_INTERVAL_MS: u64 = 1_000;
