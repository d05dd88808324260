use anyhow::Result;
use chrono::Utc;
use common::PIECES_PER_PLAYER;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::Database;
use crate::db::models::PiecePointer;
use crate::db::partition_keys::PartitionKeys;

/// Position every piece starts from before its first move
pub const INITIAL_POSITION: &str = "initial";

pub fn piece_id(index: u32) -> String {
    format!("piece_{}", index)
}

/// Durable piece pointer rows: one per piece, holding only its latest move
#[derive(Clone)]
pub struct GamePieces {
    db: Arc<dyn Database>,
}

impl GamePieces {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Creates the starting pieces for one player of a match. Returns false
    /// when the player already has pieces in this game.
    pub async fn create_pieces_for_match(&self, game_id: &str, user_id: &str) -> Result<bool> {
        if !self.user_pieces(game_id, user_id).await?.is_empty() {
            debug!(game_id, user_id, "Pieces already exist, skipping creation");
            return Ok(false);
        }

        let now = Utc::now();
        for index in 1..=PIECES_PER_PLAYER {
            let pointer = PiecePointer {
                game_id: game_id.to_string(),
                user_id: user_id.to_string(),
                piece_id: piece_id(index),
                player_id: user_id.to_string(),
                move_number: 0,
                from_position: String::new(),
                to_position: INITIAL_POSITION.to_string(),
                piece_type: "standard".to_string(),
                captured_piece: None,
                updated_at: now,
            };
            self.db.put_item(pointer.to_item()?).await?;
        }

        info!(game_id, user_id, pieces = PIECES_PER_PLAYER, "Created pieces for match");
        Ok(true)
    }

    pub async fn user_pieces(&self, game_id: &str, user_id: &str) -> Result<Vec<PiecePointer>> {
        let items = self
            .db
            .query_partition(
                &PartitionKeys::piece_pointers(game_id, user_id),
                Some(PartitionKeys::PIECE_POINTER_PREFIX),
                None,
            )
            .await?;
        items.iter().map(|item| item.parse()).collect()
    }

    pub async fn upsert_pointer(
        &self,
        game_id: &str,
        user_id: &str,
        piece_id: &str,
        from_position: &str,
        to_position: &str,
        piece_type: &str,
        captured_piece: Option<&str>,
    ) -> Result<()> {
        let pointer = PiecePointer {
            game_id: game_id.to_string(),
            user_id: user_id.to_string(),
            piece_id: piece_id.to_string(),
            player_id: user_id.to_string(),
            move_number: 0,
            from_position: from_position.to_string(),
            to_position: to_position.to_string(),
            piece_type: piece_type.to_string(),
            captured_piece: captured_piece.map(str::to_string),
            updated_at: Utc::now(),
        };
        self.db.put_item(pointer.to_item()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;

    #[tokio::test]
    async fn test_piece_creation_is_idempotent_per_user() {
        let pieces = GamePieces::new(Arc::new(MemoryDatabase::new()));

        assert!(pieces.create_pieces_for_match("g1", "u1").await.unwrap());
        assert!(!pieces.create_pieces_for_match("g1", "u1").await.unwrap());
        assert!(pieces.create_pieces_for_match("g1", "u2").await.unwrap());

        let owned = pieces.user_pieces("g1", "u1").await.unwrap();
        let ids: Vec<_> = owned.iter().map(|p| p.piece_id.as_str()).collect();
        assert_eq!(ids, vec!["piece_1", "piece_2", "piece_3", "piece_4"]);
        assert!(owned.iter().all(|p| p.to_position == INITIAL_POSITION && p.move_number == 0));
    }

    #[tokio::test]
    async fn test_upsert_overwrites_pointer() {
        let pieces = GamePieces::new(Arc::new(MemoryDatabase::new()));
        pieces.create_pieces_for_match("g1", "u1").await.unwrap();

        pieces
            .upsert_pointer("g1", "u1", "piece_2", "initial", "total 5", "standard", None)
            .await
            .unwrap();

        let owned = pieces.user_pieces("g1", "u1").await.unwrap();
        assert_eq!(owned.len(), 4);
        assert_eq!(owned[1].to_position, "total 5");
    }
}
