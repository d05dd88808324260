use anyhow::Result;
use arena_server::cache::CacheStore;
use arena_server::db::partition_keys::{join_day, join_month};
use arena_server::error::{GatewayError, SessionError};
use arena_server::redis_keys::RedisKeys;
use arena_server::session_registry::Session;
use chrono::{Duration as ChronoDuration, Utc};
use ::common::JoinStatus;
use std::time::Duration;

mod common;
use self::common::{MockTokenValidator, TestEnvironment};

fn session(mobile: &str, device: &str) -> Session {
    Session::new(mobile, mobile, device, "fcm-1", "jwt-1", Duration::from_secs(3600)).unwrap()
}

#[tokio::test]
async fn test_session_round_trip_and_expiry() -> Result<()> {
    let env = TestEnvironment::new(MockTokenValidator::new());
    let created = env.sessions.create(session("5550001", "D1")).await?;

    let loaded = env.sessions.get(&created.session_token).await?;
    assert_eq!(loaded.mobile_no, "5550001");
    assert_eq!(loaded.device_id, "D1");
    assert_eq!(loaded.fcm_token, "fcm-1");

    // Force the session past its expiry
    let mut expired = session("5550002", "D1");
    expired.expires_at = Utc::now() - ChronoDuration::seconds(1);
    let expired = env.sessions.create(expired).await?;
    let key = RedisKeys::session(&expired.session_token);
    assert!(env.cache.get(&key).await?.is_some());

    assert!(matches!(
        env.sessions.get(&expired.session_token).await,
        Err(SessionError::Expired)
    ));
    assert!(env.cache.get(&key).await?.is_none());
    assert!(env.sessions.get(&expired.session_token).await.is_err());
    assert!(env.cache.get(&key).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_disconnect_keeps_session_and_retires_pending_entries() -> Result<()> {
    let env = TestEnvironment::new(MockTokenValidator::new());
    let mut tok1 = session("5550001", "D1");
    tok1.session_token = "tok1".to_string();
    env.sessions.create(tok1).await?;

    env.gateway.on_socket_connect("tok1", "sockA").await?;
    let entry = env.gateway.on_contest_join("sockA", "3", None).await?;
    assert!(env.rerun.take(), "a join should request an immediate pass");

    let moved = env.gateway.on_socket_disconnect("sockA").await?;
    assert_eq!(moved, 1);

    assert!(matches!(
        env.sessions.get_by_socket("sockA").await,
        Err(SessionError::NotFound)
    ));
    let kept = env.sessions.get("tok1").await?;
    assert_eq!(kept.socket_id, None);

    let month = join_month(&entry.joined_at);
    let manager = env.engine.manager();
    assert!(manager.league_joins("5550001", JoinStatus::Pending, &month).await?.is_empty());
    assert_eq!(
        manager.league_joins("5550001", JoinStatus::Disconnected, &month).await?.len(),
        1
    );

    // The session can be picked up again from a new socket
    env.gateway.on_socket_connect("tok1", "sockB").await?;
    assert_eq!(env.sessions.get_by_socket("sockB").await?.session_token, "tok1");
    Ok(())
}

#[tokio::test]
async fn test_authenticate_validates_tokens() -> Result<()> {
    let env = TestEnvironment::new(MockTokenValidator::new().with_token("jwt-good", "5550003", "D9"));

    let session = env.gateway.authenticate("jwt-good", Some("sock9")).await?;
    assert_eq!(session.user_id, "5550003");
    assert_eq!(session.fcm_token, "fcm-D9");
    assert_eq!(env.sessions.get_by_socket("sock9").await?.session_token, session.session_token);
    assert!(env.sessions.validate(&session.session_token, "5550003", "D9").await.is_ok());

    assert!(matches!(
        env.gateway.authenticate("jwt-bad", None).await,
        Err(GatewayError::Auth(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_durable_outage_does_not_fail_session_creation() -> Result<()> {
    let env = TestEnvironment::new(MockTokenValidator::new());
    env.db.set_fail_writes(true);

    let created = env.sessions.create(session("5550004", "D1")).await?;
    assert_eq!(env.sessions.get(&created.session_token).await?.mobile_no, "5550004");

    // Socket mappings only live in the durable tier, so that failure is surfaced
    assert!(matches!(
        env.sessions.update_socket_mapping(&created.session_token, "sockX").await,
        Err(SessionError::DurableWrite(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_after_session_lapsed_still_leaves_the_queue() -> Result<()> {
    let env = TestEnvironment::new(MockTokenValidator::new());
    let mut lapsed = session("5550005", "D1");
    lapsed.socket_id = Some("sockA".to_string());
    lapsed.expires_at = Utc::now() - ChronoDuration::seconds(1);
    env.sessions.create(lapsed).await?;

    let manager = env.engine.manager();
    let entry = manager.join_contest("5550005", "3", None).await?;
    assert!(matches!(
        env.sessions.get_by_socket("sockA").await,
        Err(SessionError::Expired)
    ));

    assert_eq!(env.gateway.on_socket_disconnect("sockA").await?, 1);

    let month = join_month(&entry.joined_at);
    assert!(manager.league_joins("5550005", JoinStatus::Pending, &month).await?.is_empty());
    assert_eq!(
        manager.league_joins("5550005", JoinStatus::Disconnected, &month).await?.len(),
        1
    );
    assert!(manager.pending_entries("3", &join_day(&entry.joined_at), 10).await?.is_empty());
    Ok(())
}
