use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    auth::TokenValidator,
    cache::CacheStore,
    cluster_singleton::{ClusterSingleton, ServiceFuture},
    config::AppConfig,
    db::Database,
    gateway::GameGateway,
    matchmaking::MatchmakingEngine,
    player_connections::Notifier,
    redis_keys::RedisKeys,
    scheduler::{RerunFlag, Scheduler},
    session_registry::SessionRegistry,
};

/// Configuration for a game server instance
pub struct GameServerConfig {
    /// Cache tier (sessions, move buffers, the matchmaking lease)
    pub cache: Arc<dyn CacheStore>,
    /// Durable tier
    pub db: Arc<dyn Database>,
    /// Client token validation
    pub validator: Arc<dyn TokenValidator>,
    /// Outbound delivery to connected clients
    pub notifier: Arc<dyn Notifier>,
    pub app: AppConfig,
}

/// A running server: the transport-facing gateway plus the matchmaking
/// scheduler, which only runs while this server holds the cluster lease.
pub struct GameServer {
    pub server_id: u64,
    gateway: Arc<GameGateway>,
    engine: Arc<MatchmakingEngine>,
    sessions: Arc<SessionRegistry>,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl GameServer {
    pub fn id(&self) -> u64 {
        self.server_id
    }

    pub fn gateway(&self) -> &Arc<GameGateway> {
        &self.gateway
    }

    pub fn engine(&self) -> &Arc<MatchmakingEngine> {
        &self.engine
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub async fn start(config: GameServerConfig) -> Result<Self> {
        let GameServerConfig {
            cache,
            db,
            validator,
            notifier,
            app,
        } = config;
        let server_id = app.server_id;

        let cancellation_token = CancellationToken::new();
        let mut handles = Vec::new();
        let rerun = RerunFlag::new();

        let sessions = Arc::new(SessionRegistry::new(cache.clone(), db.clone(), app.sessions.clone()));
        let engine = Arc::new(
            MatchmakingEngine::new(db.clone(), app.matchmaking.league_ids.clone())
                .with_notifier(notifier.clone()),
        );
        let gateway = Arc::new(GameGateway::new(
            validator,
            sessions.clone(),
            cache.clone(),
            db,
            notifier,
            rerun.clone(),
        ));

        let scheduler = Scheduler::new(engine.clone(), app.matchmaking.clone())
            .with_sessions(sessions.clone())
            .with_rerun_flag(rerun);

        // Only one server in the cluster pairs players at a time
        info!(server_id, leagues = ?app.matchmaking.league_ids, "Starting matchmaking service");
        let singleton = ClusterSingleton::new(
            cache,
            server_id,
            RedisKeys::matchmaking_singleton_lease(),
            app.lease_duration,
            cancellation_token.clone(),
        );
        handles.push(tokio::spawn(async move {
            let service = move |token: CancellationToken| {
                let scheduler = scheduler.clone();
                Box::pin(async move {
                    info!("Matchmaking scheduler is now active on this server");
                    scheduler.run(token).await
                }) as ServiceFuture
            };

            if let Err(e) = singleton.run(service).await {
                error!(error = %e, "Cluster singleton error for matchmaking");
            }
        }));

        info!(server_id, "Game server started");

        Ok(Self {
            server_id,
            gateway,
            engine,
            sessions,
            cancellation_token,
            handles,
        })
    }

    /// Stops the matchmaking service and waits for background tasks
    pub async fn shutdown(mut self) -> Result<()> {
        info!(server_id = self.server_id, "Starting graceful shutdown");
        self.cancellation_token.cancel();

        while let Some(handle) = self.handles.pop() {
            match tokio::time::timeout(Duration::from_secs(15), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = ?e, "Service panicked during shutdown"),
                Err(_) => error!("Service shutdown timed out"),
            }
        }

        info!(server_id = self.server_id, "Game server shut down gracefully");
        Ok(())
    }
}
