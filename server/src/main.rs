use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arena_server::auth::JwtTokenValidator;
use arena_server::cache::RedisCache;
use arena_server::config::AppConfig;
use arena_server::db::DynamoDatabase;
use arena_server::game_server::{GameServer, GameServerConfig};
use arena_server::player_connections::ConnectionNotifier;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if exists
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let app = AppConfig::from_env().context("Failed to load configuration")?;
    let jwt_secret = app
        .jwt_secret
        .clone()
        .context("ARENA_JWT_SECRET must be set in environment or .env file")?;

    let cache = RedisCache::connect(&app.redis_url)
        .await
        .context("Failed to connect to the cache tier")?;
    let db = DynamoDatabase::new(&app.dynamodb_table_prefix)
        .await
        .context("Failed to initialise the durable tier")?;

    let config = GameServerConfig {
        cache: Arc::new(cache),
        db: Arc::new(db),
        validator: Arc::new(JwtTokenValidator::new(&jwt_secret)),
        notifier: Arc::new(ConnectionNotifier::new()),
        app,
    };

    let game_server = GameServer::start(config).await?;
    info!("Server {} started successfully", game_server.id());

    // Wait for shutdown signal
    info!("Server started. Waiting for shutdown signal (Ctrl+C)...");
    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal. Shutting down gracefully...");
    game_server.shutdown().await?;

    info!("Server shut down successfully");
    Ok(())
}
