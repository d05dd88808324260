use chrono::Utc;
use common::{GAME_END, JoinStatus, OPPONENT_DICE_ROLL, OPPONENT_MOVE, USER_DISCONNECTED};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::TokenValidator;
use crate::cache::CacheStore;
use crate::db::Database;
use crate::db::models::{DiceRoll, MatchPair, PendingEntry};
use crate::db::partition_keys::join_month;
use crate::dice::DiceService;
use crate::error::{GatewayError, MatchmakingError};
use crate::matchmaking_manager::MatchmakingManager;
use crate::move_buffer::{FlushReport, MoveBuffer, PieceMove, PieceMoveBuffer};
use crate::player_connections::Notifier;
use crate::scheduler::RerunFlag;
use crate::session_registry::{Session, SessionRegistry};

type Result<T> = std::result::Result<T, GatewayError>;

/// A move as sent by the client; the mover is taken from the socket's session
#[derive(Debug, Clone, Deserialize)]
pub struct MoveRequest {
    pub game_id: String,
    pub piece_id: String,
    pub from_position: String,
    pub to_position: String,
    pub piece_type: String,
    #[serde(default)]
    pub captured_piece: Option<String>,
}

/// Entry points the transport layer calls for each client event
pub struct GameGateway {
    validator: Arc<dyn TokenValidator>,
    sessions: Arc<SessionRegistry>,
    matchmaking: MatchmakingManager,
    buffer: MoveBuffer,
    dice: DiceService,
    notifier: Arc<dyn Notifier>,
    rerun: RerunFlag,
    session_lifetime: Duration,
}

impl GameGateway {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        sessions: Arc<SessionRegistry>,
        cache: Arc<dyn CacheStore>,
        db: Arc<dyn Database>,
        notifier: Arc<dyn Notifier>,
        rerun: RerunFlag,
    ) -> Self {
        let session_lifetime = sessions.config().ttl;
        Self {
            validator,
            sessions,
            matchmaking: MatchmakingManager::new(db.clone()),
            buffer: MoveBuffer::new(cache, db.clone()),
            dice: DiceService::new(db),
            notifier,
            rerun,
            session_lifetime,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn move_buffer(&self) -> &MoveBuffer {
        &self.buffer
    }

    /// Validates a client token and opens a session for it
    pub async fn authenticate(&self, jwt_token: &str, socket_id: Option<&str>) -> Result<Session> {
        let identity = self.validator.validate(jwt_token).await?;

        // The token carries no separate user id; the mobile number identifies the player
        let mut session = Session::new(
            &identity.mobile_no,
            &identity.mobile_no,
            &identity.device_id,
            &identity.fcm_token,
            jwt_token,
            self.session_lifetime,
        )?;
        session.socket_id = socket_id.map(str::to_string);

        Ok(self.sessions.create(session).await?)
    }

    /// Binds a (re)connected socket to an existing session
    pub async fn on_socket_connect(&self, session_token: &str, socket_id: &str) -> Result<Session> {
        let session = self.sessions.update_socket_mapping(session_token, socket_id).await?;
        debug!(user_id = %session.user_id, socket_id, "Socket bound to session");
        Ok(session)
    }

    pub async fn on_contest_join(
        &self,
        socket_id: &str,
        league_id: &str,
        extra_data: Option<JsonValue>,
    ) -> Result<PendingEntry> {
        let session = self.sessions.get_by_socket(socket_id).await?;
        let entry = self
            .matchmaking
            .join_contest(&session.user_id, league_id, extra_data)
            .await?;

        self.rerun.request();
        Ok(entry)
    }

    pub async fn on_cancel_search(&self, socket_id: &str, league_id: &str) -> Result<usize> {
        let session = self.sessions.get_by_socket(socket_id).await?;
        Ok(self.matchmaking.cancel_search(&session.user_id, league_id).await?)
    }

    pub async fn on_piece_move(&self, socket_id: &str, request: MoveRequest) -> Result<PieceMoveBuffer> {
        let session = self.sessions.get_by_socket(socket_id).await?;
        let opponent_id = self.opponent(&request.game_id, &session.user_id).await?;

        let mv = PieceMove {
            game_id: request.game_id,
            user_id: session.user_id.clone(),
            piece_id: request.piece_id,
            from_position: request.from_position,
            to_position: request.to_position,
            piece_type: request.piece_type,
            captured_piece: request.captured_piece,
        };
        let buffer = self.buffer.record_move(&mv).await?;

        let payload = json!({
            "game_id": mv.game_id,
            "user_id": mv.user_id,
            "piece_id": mv.piece_id,
            "from_position": mv.from_position,
            "to_position": mv.to_position,
            "piece_type": mv.piece_type,
            "captured_piece": mv.captured_piece,
            "total_moves": buffer.total_moves,
        });
        self.notify(&opponent_id, OPPONENT_MOVE, payload).await;

        Ok(buffer)
    }

    pub async fn on_dice_roll(&self, socket_id: &str, game_id: &str) -> Result<DiceRoll> {
        let session = self.sessions.get_by_socket(socket_id).await?;
        let opponent_id = self.opponent(game_id, &session.user_id).await?;

        let roll = self.dice.roll(game_id, &session.user_id).await?;
        let payload = json!({
            "game_id": game_id,
            "user_id": session.user_id,
            "value": roll.value,
            "rolled_at": roll.rolled_at,
        });
        self.notify(&opponent_id, OPPONENT_DICE_ROLL, payload).await;

        Ok(roll)
    }

    /// Persists the game's buffered moves and tells both players the game is over.
    /// Safe to call again if a previous flush skipped entries.
    pub async fn on_game_end(&self, game_id: &str) -> Result<FlushReport> {
        let report = self.buffer.flush_game(game_id).await?;
        info!(game_id, flushed = report.flushed, skipped = report.skipped, "Game ended");

        match self.matchmaking.match_pair(game_id).await? {
            Some(pair) => {
                let payload = json!({
                    "game_id": game_id,
                    "flushed": report.flushed,
                    "ended_at": Utc::now(),
                });
                for user_id in [&pair.user1_id, &pair.user2_id] {
                    self.notify(user_id, GAME_END, payload.clone()).await;
                }
            }
            None => warn!(game_id, "Game ended without a match pair, nobody to notify"),
        }

        Ok(report)
    }

    /// Transport disconnect: drops the socket mapping and takes the user out of
    /// future pairing. The session stays valid for a reconnect. The user comes
    /// from the mapping row, so a lapsed session still leaves the queue.
    pub async fn on_socket_disconnect(&self, socket_id: &str) -> Result<usize> {
        let Some(mapping) = self.sessions.remove_socket_mapping(socket_id).await? else {
            debug!(socket_id, "Disconnected socket had no mapping");
            return Ok(0);
        };

        self.notify_paired_opponents(&mapping.user_id).await;
        let moved = self.matchmaking.disconnect_user(&mapping.user_id).await?;
        info!(user_id = %mapping.user_id, socket_id, moved, "Socket disconnected");
        Ok(moved)
    }

    /// Live ledger rows that already carry an opponent belong to a fresh match
    async fn notify_paired_opponents(&self, user_id: &str) {
        let month = join_month(&Utc::now());
        let records = match self.matchmaking.league_joins(user_id, JoinStatus::Pending, &month).await {
            Ok(records) => records,
            Err(e) => {
                warn!(user_id, error = %e, "Failed to read league joins for disconnect notice");
                return;
            }
        };

        for record in records {
            if let (Some(opponent_id), Some(match_id)) = (&record.opponent_user_id, &record.match_pair_id) {
                let payload = json!({ "user_id": user_id, "match_id": match_id });
                self.notify(opponent_id, USER_DISCONNECTED, payload).await;
            }
        }
    }

    async fn opponent(&self, game_id: &str, user_id: &str) -> Result<String> {
        let pair: MatchPair = self
            .matchmaking
            .match_pair(game_id)
            .await?
            .ok_or_else(|| MatchmakingError::MatchNotFound(game_id.to_string()))?;

        pair.opponent_of(user_id)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::NotInMatch {
                user_id: user_id.to_string(),
                game_id: game_id.to_string(),
            })
    }

    /// Delivery is best effort; an offline opponent catches up on reconnect
    async fn notify(&self, user_id: &str, event: &str, payload: JsonValue) {
        if let Err(e) = self.notifier.send_to_user(user_id, event, payload).await {
            debug!(user_id, event, error = %e, "Notification not delivered");
        }
    }
}
