//! Write-behind buffer for in-game piece moves.
//!
//! Every move rewrites one cache entry per piece. The durable tier only sees a
//! lightweight pointer row per move and, when the game ends, one consolidated
//! record per piece.

use chrono::{DateTime, Utc};
use common::{MOVE_HISTORY_LIMIT, PIECE_BUFFER_TTL_SECS, TOTAL_BOARD_POSITIONS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::db::Database;
use crate::db::models::{MoveEntry, PieceMetadata, PieceMoveRecord, PieceState};
use crate::db::partition_keys::PartitionKeys;
use crate::error::BufferError;
use crate::game_pieces::{GamePieces, INITIAL_POSITION};
use crate::redis_keys::RedisKeys;

type Result<T> = std::result::Result<T, BufferError>;

/// One piece move as reported by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceMove {
    pub game_id: String,
    pub user_id: String,
    pub piece_id: String,
    pub from_position: String,
    pub to_position: String,
    pub piece_type: String,
    pub captured_piece: Option<String>,
}

/// Cache-resident state of one piece during a live game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceMoveBuffer {
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
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PieceMoveBuffer {
    fn new(mv: &PieceMove, at: DateTime<Utc>) -> Self {
        let position_number = parse_position_number(INITIAL_POSITION);
        Self {
            game_id: mv.game_id.clone(),
            user_id: mv.user_id.clone(),
            piece_id: mv.piece_id.clone(),
            player_id: mv.user_id.clone(),
            piece_type: mv.piece_type.clone(),
            total_moves: 0,
            last_position: INITIAL_POSITION.to_string(),
            last_move_time: at,
            current_state: PieceState {
                position: INITIAL_POSITION.to_string(),
                position_number: position_number.clone(),
                status: "active".to_string(),
                moves: 0,
                last_move_time: at,
            },
            move_history: Vec::new(),
            metadata: PieceMetadata {
                created_by: mv.user_id.clone(),
                game_type: "standard".to_string(),
                piece_value: 1,
                current_position_number: position_number,
                total_positions: TOTAL_BOARD_POSITIONS,
            },
            created_at: at,
            updated_at: at,
        }
    }

    fn apply(&mut self, mv: &PieceMove, at: DateTime<Utc>) {
        let position_number = parse_position_number(&mv.to_position);

        self.total_moves += 1;
        self.last_position = mv.to_position.clone();
        self.last_move_time = at;
        self.piece_type = mv.piece_type.clone();
        self.updated_at = at;

        self.current_state.position = mv.to_position.clone();
        self.current_state.position_number = position_number.clone();
        self.current_state.moves = self.total_moves;
        self.current_state.last_move_time = at;
        self.metadata.current_position_number = position_number.clone();

        self.move_history.push(MoveEntry {
            move_number: self.total_moves,
            from_position: mv.from_position.clone(),
            to_position: mv.to_position.clone(),
            position_number,
            captured_piece: mv.captured_piece.clone(),
            timestamp: at,
        });
        if self.move_history.len() > MOVE_HISTORY_LIMIT {
            let excess = self.move_history.len() - MOVE_HISTORY_LIMIT;
            self.move_history.drain(..excess);
        }
    }

    fn validate(&self, key: &str) -> Result<()> {
        let invalid = |reason: &str| BufferError::Validation {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        for (field, value) in [
            ("game_id", &self.game_id),
            ("user_id", &self.user_id),
            ("piece_id", &self.piece_id),
            ("player_id", &self.player_id),
            ("last_position", &self.last_position),
        ] {
            if value.is_empty() {
                return Err(invalid(&format!("missing required field: {}", field)));
            }
        }
        if self.total_moves == 0 {
            return Err(invalid("no moves recorded"));
        }
        if key != RedisKeys::piece_moves(&self.game_id, &self.user_id, &self.piece_id) {
            return Err(invalid("entry does not belong to its key"));
        }
        Ok(())
    }

    fn into_record(self, flushed_at: DateTime<Utc>) -> PieceMoveRecord {
        PieceMoveRecord {
            game_id: self.game_id,
            user_id: self.user_id,
            piece_id: self.piece_id,
            player_id: self.player_id,
            piece_type: self.piece_type,
            total_moves: self.total_moves,
            last_position: self.last_position,
            last_move_time: self.last_move_time,
            current_state: self.current_state,
            move_history: self.move_history,
            metadata: self.metadata,
            flushed_at,
        }
    }
}

/// Board positions may arrive as `"total 57"`; only the number is kept.
pub fn parse_position_number(position: &str) -> String {
    if position.contains("total") {
        if let Some(number) = position.split_whitespace().nth(1) {
            return number.to_string();
        }
    }
    position.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateSource {
    Cache,
    Durable,
}

/// Where a piece currently stands, from whichever tier had it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentPiece {
    pub piece_id: String,
    pub from_position: String,
    pub to_position: String,
    /// Only known while the cache buffer exists
    pub total_moves: Option<u32>,
    pub source: StateSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub flushed: usize,
    pub skipped: usize,
}

pub struct MoveBuffer {
    cache: Arc<dyn CacheStore>,
    db: Arc<dyn Database>,
    pieces: GamePieces,
    ttl: Duration,
}

impl MoveBuffer {
    pub fn new(cache: Arc<dyn CacheStore>, db: Arc<dyn Database>) -> Self {
        Self {
            pieces: GamePieces::new(db.clone()),
            cache,
            db,
            ttl: Duration::from_secs(PIECE_BUFFER_TTL_SECS),
        }
    }

    async fn load(&self, key: &str) -> Result<Option<PieceMoveBuffer>> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        let buffer: PieceMoveBuffer =
            serde_json::from_str(&raw).map_err(|e| BufferError::Validation {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        buffer.validate(key)?;
        Ok(Some(buffer))
    }

    /// Applies one move to the piece's buffer entry and mirrors the latest
    /// positions onto the durable pointer row.
    pub async fn record_move(&self, mv: &PieceMove) -> Result<PieceMoveBuffer> {
        let key = RedisKeys::piece_moves(&mv.game_id, &mv.user_id, &mv.piece_id);
        let now = Utc::now();

        let mut buffer = match self.load(&key).await {
            Ok(Some(buffer)) => buffer,
            Ok(None) => PieceMoveBuffer::new(mv, now),
            Err(BufferError::Validation { reason, .. }) => {
                warn!(key = %key, reason = %reason, "Discarding malformed buffer entry");
                PieceMoveBuffer::new(mv, now)
            }
            Err(e) => return Err(e),
        };
        buffer.apply(mv, now);

        let json = serde_json::to_string(&buffer)
            .map_err(|e| BufferError::Storage(anyhow::Error::new(e).context("Failed to encode buffer entry")))?;
        self.cache.set_ex(&key, &json, self.ttl).await?;

        if let Err(e) = self
            .pieces
            .upsert_pointer(
                &mv.game_id,
                &mv.user_id,
                &mv.piece_id,
                &mv.from_position,
                &mv.to_position,
                &mv.piece_type,
                mv.captured_piece.as_deref(),
            )
            .await
        {
            warn!(key = %key, error = %e, "Failed to update durable piece pointer");
        }

        debug!(key = %key, total_moves = buffer.total_moves, "Recorded piece move");
        Ok(buffer)
    }

    /// Moves every buffered piece of a game to the durable tier. Entries that
    /// fail are left in the cache and counted as skipped, so calling this again
    /// retries exactly those.
    pub async fn flush_game(&self, game_id: &str) -> Result<FlushReport> {
        let keys = self
            .cache
            .scan_prefix(&RedisKeys::piece_moves_for_game(game_id))
            .await?;
        let mut report = FlushReport::default();

        for key in keys {
            let buffer = match self.load(&key).await {
                Ok(Some(buffer)) => buffer,
                // Gone since the scan
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping buffer entry");
                    report.skipped += 1;
                    continue;
                }
            };

            let record = buffer.into_record(Utc::now());
            let written = match record.to_item() {
                Ok(item) => self.db.put_item(item).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                error!(key = %key, error = %e, "Failed to write piece move record");
                report.skipped += 1;
                continue;
            }

            if let Err(e) = self.cache.del(&key).await {
                warn!(key = %key, error = %e, "Flushed piece but failed to drop its buffer entry");
            }
            report.flushed += 1;
        }

        info!(game_id, flushed = report.flushed, skipped = report.skipped, "Flushed game move buffers");
        Ok(report)
    }

    /// Current piece positions, preferring the live cache buffers and falling
    /// back to the durable pointer rows.
    pub async fn current_state(&self, game_id: &str, user_id: &str) -> Result<Vec<CurrentPiece>> {
        match self.cached_state(game_id, user_id).await {
            Ok(pieces) if !pieces.is_empty() => return Ok(pieces),
            Ok(_) => {}
            Err(e) => warn!(game_id, user_id, error = %e, "Cache read failed, using durable pointers"),
        }

        let pointers = self.pieces.user_pieces(game_id, user_id).await?;
        Ok(pointers
            .into_iter()
            .map(|p| CurrentPiece {
                piece_id: p.piece_id,
                from_position: p.from_position,
                to_position: p.to_position,
                total_moves: None,
                source: StateSource::Durable,
            })
            .collect())
    }

    async fn cached_state(&self, game_id: &str, user_id: &str) -> Result<Vec<CurrentPiece>> {
        let keys = self
            .cache
            .scan_prefix(&RedisKeys::piece_moves_for_user(game_id, user_id))
            .await?;
        let mut pieces = Vec::with_capacity(keys.len());

        for key in keys {
            match self.load(&key).await {
                Ok(Some(buffer)) => {
                    let from_position = buffer
                        .move_history
                        .last()
                        .map(|m| m.from_position.clone())
                        .unwrap_or_default();
                    pieces.push(CurrentPiece {
                        piece_id: buffer.piece_id,
                        from_position,
                        to_position: buffer.last_position,
                        total_moves: Some(buffer.total_moves),
                        source: StateSource::Cache,
                    });
                }
                Ok(None) => {}
                // A malformed entry counts as a miss
                Err(BufferError::Validation { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Ignoring malformed buffer entry");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(pieces)
    }

    /// Consolidated records written by earlier flushes
    pub async fn piece_history(&self, game_id: &str, user_id: &str) -> Result<Vec<PieceMoveRecord>> {
        let items = self
            .db
            .query_partition(&PartitionKeys::piece_moves(game_id, user_id), None, None)
            .await?;
        Ok(items
            .iter()
            .map(|item| item.parse())
            .collect::<anyhow::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::MemoryDatabase;

    fn piece_move(piece_id: &str, from: &str, to: &str) -> PieceMove {
        PieceMove {
            game_id: "g1".to_string(),
            user_id: "u1".to_string(),
            piece_id: piece_id.to_string(),
            from_position: from.to_string(),
            to_position: to.to_string(),
            piece_type: "standard".to_string(),
            captured_piece: None,
        }
    }

    #[test]
    fn test_parse_position_number() {
        assert_eq!(parse_position_number("total 57"), "57");
        assert_eq!(parse_position_number("12"), "12");
        assert_eq!(parse_position_number("total"), "total");
    }

    #[tokio::test]
    async fn test_history_keeps_latest_moves() {
        let buffer = MoveBuffer::new(Arc::new(MemoryCache::new()), Arc::new(MemoryDatabase::new()));

        let mut last = None;
        for step in 1..=15 {
            let mv = piece_move("piece_1", &format!("{}", step - 1), &format!("{}", step));
            last = Some(buffer.record_move(&mv).await.unwrap());
        }

        let last = last.unwrap();
        assert_eq!(last.total_moves, 15);
        assert_eq!(last.move_history.len(), 10);
        assert_eq!(last.move_history.first().map(|m| m.move_number), Some(6));
        assert_eq!(last.move_history.last().map(|m| m.move_number), Some(15));
        assert_eq!(last.current_state.moves, 15);
        assert_eq!(last.metadata.total_positions, 57);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_replaced() {
        let cache = Arc::new(MemoryCache::new());
        let buffer = MoveBuffer::new(cache.clone(), Arc::new(MemoryDatabase::new()));
        cache
            .set_ex(&RedisKeys::piece_moves("g1", "u1", "piece_1"), "{not json", Duration::from_secs(60))
            .await
            .unwrap();

        let recorded = buffer.record_move(&piece_move("piece_1", "initial", "3")).await.unwrap();
        assert_eq!(recorded.total_moves, 1);
    }

    #[tokio::test]
    async fn test_flush_skips_malformed_entries_and_keeps_them() {
        let cache = Arc::new(MemoryCache::new());
        let db = Arc::new(MemoryDatabase::new());
        let buffer = MoveBuffer::new(cache.clone(), db.clone());

        buffer.record_move(&piece_move("piece_1", "initial", "4")).await.unwrap();
        let bad_key = RedisKeys::piece_moves("g1", "u1", "piece_2");
        cache.set_ex(&bad_key, "[]", Duration::from_secs(60)).await.unwrap();

        let report = buffer.flush_game("g1").await.unwrap();
        assert_eq!(report, FlushReport { flushed: 1, skipped: 1 });
        assert!(cache.get(&bad_key).await.unwrap().is_some());
        assert_eq!(buffer.piece_history("g1", "u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_current_state_falls_back_to_pointers() {
        let cache = Arc::new(MemoryCache::new());
        let buffer = MoveBuffer::new(cache.clone(), Arc::new(MemoryDatabase::new()));
        buffer.record_move(&piece_move("piece_3", "initial", "total 9")).await.unwrap();

        let live = buffer.current_state("g1", "u1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].source, StateSource::Cache);
        assert_eq!(live[0].total_moves, Some(1));

        // Simulate a cache restart
        cache.del(&RedisKeys::piece_moves("g1", "u1", "piece_3")).await.unwrap();
        let recovered = buffer.current_state("g1", "u1").await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].source, StateSource::Durable);
        assert_eq!(recovered[0].to_position, "total 9");
        assert_eq!(recovered[0].from_position, "initial");
    }
}
