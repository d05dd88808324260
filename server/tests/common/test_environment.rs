use anyhow::{Context, Result};
use arena_server::cache::MemoryCache;
use arena_server::config::{SessionConfig, default_league_ids};
use arena_server::db::MemoryDatabase;
use arena_server::db::models::{LeagueJoinRecord, PendingEntry};
use arena_server::db::Database;
use arena_server::gateway::GameGateway;
use arena_server::matchmaking::MatchmakingEngine;
use arena_server::player_connections::{ConnectionNotifier, OutboundEvent};
use arena_server::scheduler::RerunFlag;
use arena_server::session_registry::{Session, SessionRegistry};
use chrono::{DateTime, Utc};
use ::common::JoinStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::mock_validator::MockTokenValidator;

/// All subsystems wired over the in-memory storage backends
pub struct TestEnvironment {
    pub cache: Arc<MemoryCache>,
    pub db: Arc<MemoryDatabase>,
    pub notifier: Arc<ConnectionNotifier>,
    pub sessions: Arc<SessionRegistry>,
    pub engine: MatchmakingEngine,
    pub gateway: GameGateway,
    pub rerun: RerunFlag,
}

impl TestEnvironment {
    pub fn new(validator: MockTokenValidator) -> Self {
        let cache = Arc::new(MemoryCache::new());
        let db = Arc::new(MemoryDatabase::new());
        let notifier = Arc::new(ConnectionNotifier::new());
        let rerun = RerunFlag::new();

        let sessions = Arc::new(SessionRegistry::new(
            cache.clone(),
            db.clone(),
            SessionConfig::default(),
        ));
        let engine =
            MatchmakingEngine::new(db.clone(), default_league_ids()).with_notifier(notifier.clone());
        let gateway = GameGateway::new(
            Arc::new(validator),
            sessions.clone(),
            cache.clone(),
            db.clone(),
            notifier.clone(),
            rerun.clone(),
        );

        Self {
            cache,
            db,
            notifier,
            sessions,
            engine,
            gateway,
            rerun,
        }
    }

    /// Writes a live queue entry with a chosen join time, bypassing `join_contest`
    pub async fn seed_join(
        &self,
        user_id: &str,
        league_id: &str,
        joined_at: DateTime<Utc>,
    ) -> Result<PendingEntry> {
        let entry_id = Uuid::new_v4().to_string();
        let record = LeagueJoinRecord {
            entry_id: entry_id.clone(),
            user_id: user_id.to_string(),
            league_id: league_id.to_string(),
            status_id: JoinStatus::Pending,
            status: "pending".to_string(),
            role: "player".to_string(),
            joined_at,
            opponent_user_id: None,
            opponent_league_id: None,
            match_pair_id: None,
            turn_id: None,
            extra_data: None,
            updated_at: joined_at,
        };
        let entry = PendingEntry {
            entry_id,
            user_id: user_id.to_string(),
            league_id: league_id.to_string(),
            status_id: JoinStatus::Pending,
            joined_at,
            opponent_user_id: None,
            opponent_league_id: None,
            match_pair_id: None,
            turn_id: None,
        };

        self.db.put_item(record.to_item()?).await?;
        self.db.put_item(entry.to_item()?).await?;
        Ok(entry)
    }

    /// Registers a socket with the notifier and authenticates it with `jwt`
    pub async fn connect(&self, socket_id: &str, jwt: &str) -> Result<TestClient> {
        let (tx, rx) = mpsc::channel(32);
        self.notifier.register(socket_id, tx).await;

        let session = self
            .gateway
            .authenticate(jwt, Some(socket_id))
            .await
            .context("Authentication failed")?;
        self.notifier.bind_user(socket_id, &session.user_id).await?;

        Ok(TestClient {
            socket_id: socket_id.to_string(),
            session,
            rx,
        })
    }
}

/// One connected client as seen through its outbound channel
pub struct TestClient {
    pub socket_id: String,
    pub session: Session,
    rx: mpsc::Receiver<OutboundEvent>,
}

impl TestClient {
    pub fn user_id(&self) -> &str {
        &self.session.user_id
    }

    /// Waits for the next event of the given name, discarding any others
    pub async fn expect_event(&mut self, event: &str) -> Result<OutboundEvent> {
        let wait = async {
            while let Some(message) = self.rx.recv().await {
                if message.event == event {
                    return Some(message);
                }
            }
            None
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .with_context(|| format!("Timed out waiting for {}", event))?
            .with_context(|| format!("Channel closed before {}", event))
    }

    /// Events already delivered, without waiting
    pub fn drain(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            events.push(message);
        }
        events
    }
}
