use anyhow::{Context, Result};
use common::{DEFAULT_LEAGUE_COUNT, SESSION_TTL_SECS};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_TABLE_PREFIX: &str = "arena";

/// Process configuration, read from `ARENA_*` environment variables after
/// `dotenv` has loaded any `.env` file.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: String,
    pub dynamodb_table_prefix: String,
    /// Owner value written into the matchmaking lease
    pub server_id: u64,
    pub jwt_secret: Option<String>,
    pub lease_duration: Duration,
    pub matchmaking: MatchmakingConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    pub league_ids: Vec<String>,
    pub interval: Duration,
    pub cleanup_interval: Duration,
    pub match_max_age: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            league_ids: default_league_ids(),
            interval: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(5 * 60),
            match_max_age: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl: Duration,
    /// When set, creating a session logs out every other session of the same mobile number
    pub enforce_single_session: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(SESSION_TTL_SECS),
            enforce_single_session: false,
        }
    }
}

pub fn default_league_ids() -> Vec<String> {
    (1..=DEFAULT_LEAGUE_COUNT).map(|id| id.to_string()).collect()
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let matchmaking_defaults = MatchmakingConfig::default();
        let session_defaults = SessionConfig::default();

        let league_ids = match env::var("ARENA_LEAGUE_IDS") {
            Ok(raw) => {
                let ids: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if ids.is_empty() {
                    anyhow::bail!("ARENA_LEAGUE_IDS is set but names no leagues");
                }
                ids
            }
            Err(_) => matchmaking_defaults.league_ids,
        };

        let server_id = match env::var("ARENA_SERVER_ID") {
            Ok(raw) => raw
                .parse::<u64>()
                .context("ARENA_SERVER_ID must be an unsigned integer")?,
            Err(_) => rand::random::<u64>(),
        };

        Ok(Self {
            redis_url: env::var("ARENA_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            dynamodb_table_prefix: env::var("ARENA_DYNAMODB_TABLE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_TABLE_PREFIX.to_string()),
            server_id,
            jwt_secret: env::var("ARENA_JWT_SECRET").ok(),
            lease_duration: env_millis("ARENA_LEASE_DURATION_MS", Duration::from_secs(5))?,
            matchmaking: MatchmakingConfig {
                league_ids,
                interval: env_millis("ARENA_MATCHMAKING_INTERVAL_MS", matchmaking_defaults.interval)?,
                cleanup_interval: env_millis(
                    "ARENA_CLEANUP_INTERVAL_MS",
                    matchmaking_defaults.cleanup_interval,
                )?,
                match_max_age: env_millis("ARENA_MATCH_MAX_AGE_MS", matchmaking_defaults.match_max_age)?,
            },
            sessions: SessionConfig {
                ttl: env_millis("ARENA_SESSION_TTL_MS", session_defaults.ttl)?,
                enforce_single_session: env_parse(
                    "ARENA_ENFORCE_SINGLE_SESSION",
                    session_defaults.enforce_single_session,
                )?,
            },
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    millis_setting(name, env::var(name).ok().as_deref(), default)
}

/// Durations must be non-zero: they drive sleeps, tickers and TTLs
fn millis_setting(name: &str, raw: Option<&str>, default: Duration) -> Result<Duration> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let millis: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} has an invalid value: {:?}", name, raw))?;
    if millis == 0 {
        anyhow::bail!("{} must be greater than zero", name);
    }
    Ok(Duration::from_millis(millis))
}
