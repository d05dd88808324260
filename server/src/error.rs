use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("session does not belong to the asserted mobile number and device")]
    Mismatch,
    /// A durable write the caller depends on failed (socket mappings are durable-only)
    #[error("durable write failed: {0:#}")]
    DurableWrite(anyhow::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum MatchmakingError {
    #[error("gave up after {attempts} attempts: {last_error}")]
    MaxAttemptsExceeded { attempts: u32, last_error: String },
    #[error("match {0} not found")]
    MatchNotFound(String),
    #[error("league join record {0} not found")]
    LedgerRowMissing(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("malformed buffer entry {key}: {reason}")]
    Validation { key: String, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Everything a transport-facing handler can fail with
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Matchmaking(#[from] MatchmakingError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("user {user_id} is not a player in game {game_id}")]
    NotInMatch { user_id: String, game_id: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
