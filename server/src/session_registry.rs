//! Session registry spanning both storage tiers.
//!
//! The cache holds the full session and is authoritative while the session is
//! live. The durable tier holds a reduced projection used to rehydrate the
//! cache, plus the socket and per-mobile lookup rows. Durable writes that back
//! a cache-authoritative change are best effort: they are logged, never
//! returned, so the durable projection may lag behind the cache.

use anyhow::Context;
use chrono::{DateTime, Utc};
use common::STATS_SCAN_LIMIT;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::SessionConfig;
use crate::db::Database;
use crate::db::models::{Item, MobileSessionIndex, SessionRow, SocketMapping};
use crate::db::partition_keys::{META, PartitionKeys};
use crate::error::SessionError;
use crate::redis_keys::RedisKeys;

type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_token: String,
    pub mobile_no: String,
    pub user_id: String,
    pub device_id: String,
    pub fcm_token: String,
    pub jwt_token: String,
    pub socket_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_status: Option<String>,
}

impl Session {
    /// A fresh active session with a random token, valid for `lifetime`.
    pub fn new(
        mobile_no: &str,
        user_id: &str,
        device_id: &str,
        fcm_token: &str,
        jwt_token: &str,
        lifetime: std::time::Duration,
    ) -> anyhow::Result<Self> {
        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(lifetime).context("Session lifetime out of range")?;
        Ok(Self {
            session_token: Uuid::new_v4().simple().to_string(),
            mobile_no: mobile_no.to_string(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            fcm_token: fcm_token.to_string(),
            jwt_token: jwt_token.to_string(),
            socket_id: None,
            is_active: true,
            created_at: now,
            expires_at: now + lifetime,
            user_status: None,
        })
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at
    }

    fn projection(&self) -> SessionRow {
        SessionRow {
            session_token: self.session_token.clone(),
            mobile_no: self.mobile_no.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            fcm_token: self.fcm_token.clone(),
            jwt_token: self.jwt_token.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            is_active: self.is_active,
        }
    }

    fn from_projection(row: SessionRow) -> Self {
        Self {
            session_token: row.session_token,
            mobile_no: row.mobile_no,
            user_id: row.user_id,
            device_id: row.device_id,
            fcm_token: row.fcm_token,
            jwt_token: row.jwt_token,
            socket_id: None,
            is_active: row.is_active,
            created_at: row.created_at,
            expires_at: row.expires_at,
            user_status: None,
        }
    }
}

/// Fields a session update may change. Anything else is not updatable.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionUpdate {
    pub jwt_token: Option<String>,
    pub user_status: Option<String>,
    pub socket_id: Option<String>,
}

pub struct SessionRegistry {
    cache: Arc<dyn CacheStore>,
    db: Arc<dyn Database>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(cache: Arc<dyn CacheStore>, db: Arc<dyn Database>, config: SessionConfig) -> Self {
        Self { cache, db, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn put_to_cache(&self, session: &Session) -> Result<()> {
        let json = serde_json::to_string(session).context("Failed to serialize session for cache")?;
        self.cache
            .set_ex(&RedisKeys::session(&session.session_token), &json, self.config.ttl)
            .await
            .context("Failed to write session to cache")?;
        Ok(())
    }

    async fn get_from_cache(&self, token: &str) -> anyhow::Result<Option<Session>> {
        let Some(json) = self.cache.get(&RedisKeys::session(token)).await? else {
            return Ok(None);
        };
        let session = serde_json::from_str(&json).context("Failed to deserialize cached session")?;
        Ok(Some(session))
    }

    async fn get_row(&self, token: &str) -> anyhow::Result<Option<SessionRow>> {
        let item = self.db.get_item(&PartitionKeys::session(token), META).await?;
        item.map(|item| item.parse()).transpose()
    }

    /// Best-effort durable write backing a cache-authoritative change
    async fn mirror(&self, what: &str, token: &str, item: anyhow::Result<Item>) {
        let result = match item {
            Ok(item) => self.db.put_item(item).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(session_token = %token, error = %e, "Durable {} write failed, cache remains authoritative", what);
        }
    }

    pub async fn create(&self, session: Session) -> Result<Session> {
        if self.config.enforce_single_session {
            match self.logout_others(&session.mobile_no, &session.session_token).await {
                Ok(0) => {}
                Ok(evicted) => info!(mobile_no = %session.mobile_no, evicted, "Evicted older sessions"),
                Err(e) => warn!(mobile_no = %session.mobile_no, error = %e, "Failed to evict older sessions"),
            }
        }

        self.put_to_cache(&session).await?;

        let token = session.session_token.as_str();
        self.mirror("projection", token, session.projection().to_item()).await;

        let index = MobileSessionIndex {
            mobile_no: session.mobile_no.clone(),
            session_token: session.session_token.clone(),
            created_at: session.created_at,
        };
        self.mirror("mobile index", token, index.to_item(&session.expires_at)).await;

        if let Some(socket_id) = &session.socket_id {
            let mapping = SocketMapping {
                socket_id: socket_id.clone(),
                session_token: session.session_token.clone(),
                user_id: session.user_id.clone(),
                mobile_no: session.mobile_no.clone(),
                created_at: session.created_at,
            };
            self.mirror("socket mapping", token, mapping.to_item(&session.expires_at)).await;
        }

        info!(session_token = %session.session_token, mobile_no = %session.mobile_no, "Session created");
        Ok(session)
    }

    /// Cache-aside read. Only a live session (active and not yet expired) is returned.
    pub async fn get(&self, token: &str) -> Result<Session> {
        let now = Utc::now();

        match self.get_from_cache(token).await {
            Ok(Some(session)) if session.is_live(now) => return Ok(session),
            Ok(Some(session)) => {
                if let Err(e) = self.cache.del(&RedisKeys::session(token)).await {
                    warn!(session_token = %token, error = %e, "Failed to drop dead session from cache");
                }
                return Err(if session.is_active {
                    SessionError::Expired
                } else {
                    SessionError::NotFound
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session_token = %token, error = %e, "Session cache read failed, falling back to durable store");
            }
        }

        let row = self.get_row(token).await?.ok_or(SessionError::NotFound)?;
        if !row.is_active {
            return Err(SessionError::NotFound);
        }
        if now >= row.expires_at {
            return Err(SessionError::Expired);
        }

        let session = Session::from_projection(row);
        if let Err(e) = self.put_to_cache(&session).await {
            warn!(session_token = %token, error = %e, "Failed to refill session cache");
        }
        debug!(session_token = %token, "Session rehydrated from durable store");
        Ok(session)
    }

    /// Applies the recognised fields, rewrites the cache entry in full and
    /// mirrors a changed jwt token to the durable projection.
    pub async fn update(&self, token: &str, update: SessionUpdate) -> Result<Session> {
        let mut session = self.get(token).await?;
        let jwt_changed = update.jwt_token.is_some();

        if let Some(jwt_token) = update.jwt_token {
            session.jwt_token = jwt_token;
        }
        if let Some(user_status) = update.user_status {
            session.user_status = Some(user_status);
        }
        if let Some(socket_id) = update.socket_id {
            session.socket_id = Some(socket_id);
        }

        self.put_to_cache(&session).await?;

        if jwt_changed {
            self.mirror("jwt token", token, session.projection().to_item()).await;
        }

        Ok(session)
    }

    /// Points the session at a new socket. The previous socket's mapping row
    /// is removed when it still refers to this session.
    pub async fn update_socket_mapping(&self, token: &str, socket_id: &str) -> Result<Session> {
        let mut session = self.get(token).await?;

        let mapping = SocketMapping {
            socket_id: socket_id.to_string(),
            session_token: token.to_string(),
            user_id: session.user_id.clone(),
            mobile_no: session.mobile_no.clone(),
            created_at: Utc::now(),
        };
        let item = mapping.to_item(&session.expires_at).map_err(SessionError::DurableWrite)?;
        self.db.put_item(item).await.map_err(SessionError::DurableWrite)?;

        let previous = session.socket_id.replace(socket_id.to_string());
        self.put_to_cache(&session).await?;

        if let Some(previous) = previous.filter(|p| p != socket_id) {
            if let Err(e) = self.delete_mapping_if_owned(&previous, token).await {
                warn!(socket_id = %previous, error = %e, "Failed to remove stale socket mapping");
            }
        }

        debug!(session_token = %token, socket_id, "Socket mapping updated");
        Ok(session)
    }

    async fn delete_mapping_if_owned(&self, socket_id: &str, token: &str) -> anyhow::Result<()> {
        let pk = PartitionKeys::socket(socket_id);
        if let Some(item) = self.db.get_item(&pk, META).await? {
            let mapping: SocketMapping = item.parse()?;
            if mapping.session_token == token {
                self.db.delete_item(&pk, META).await?;
            }
        }
        Ok(())
    }

    /// Socket ids are short-lived and never cached, so this always asks the durable tier.
    pub async fn get_by_socket(&self, socket_id: &str) -> Result<Session> {
        let item = self
            .db
            .get_item(&PartitionKeys::socket(socket_id), META)
            .await?
            .ok_or(SessionError::NotFound)?;
        let mapping: SocketMapping = item.parse()?;
        self.get(&mapping.session_token).await
    }

    /// Drops the socket's mapping row and clears the socket from the cached
    /// session if it is still the current one. The session survives. The
    /// removed mapping is returned even when its session is no longer live.
    pub async fn remove_socket_mapping(&self, socket_id: &str) -> Result<Option<SocketMapping>> {
        let pk = PartitionKeys::socket(socket_id);
        let Some(item) = self.db.get_item(&pk, META).await? else {
            return Ok(None);
        };
        let mapping: SocketMapping = item.parse()?;
        self.db.delete_item(&pk, META).await?;

        match self.get_from_cache(&mapping.session_token).await {
            Ok(Some(mut session)) if session.socket_id.as_deref() == Some(socket_id) => {
                session.socket_id = None;
                if let Err(e) = self.put_to_cache(&session).await {
                    warn!(socket_id, error = %e, "Failed to clear socket from cached session");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(socket_id, error = %e, "Failed to read cached session"),
        }

        debug!(socket_id, session_token = %mapping.session_token, "Socket mapping removed");
        Ok(Some(mapping))
    }

    /// Explicit logout. Transport disconnects must not call this.
    pub async fn delete(&self, token: &str) -> Result<()> {
        self.cache
            .del(&RedisKeys::session(token))
            .await
            .context("Failed to remove session from cache")?;

        if let Some(mut row) = self.get_row(token).await? {
            row.is_active = false;
            self.db.put_item(row.to_item()?).await?;
        }

        info!(session_token = %token, "Session logged out");
        Ok(())
    }

    /// Checks the session is live and belongs to the asserted mobile number and device.
    pub async fn validate(&self, token: &str, mobile_no: &str, device_id: &str) -> Result<Session> {
        let session = self.get(token).await?;
        if session.mobile_no != mobile_no || session.device_id != device_id {
            return Err(SessionError::Mismatch);
        }
        Ok(session)
    }

    async fn mobile_tokens(&self, mobile_no: &str) -> anyhow::Result<Vec<String>> {
        let items = self
            .db
            .query_partition(&PartitionKeys::mobile_sessions(mobile_no), None, None)
            .await?;
        Ok(items.into_iter().map(|item| item.sk).collect())
    }

    /// Live sessions of a mobile number
    pub async fn sessions_for_mobile(&self, mobile_no: &str) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for token in self.mobile_tokens(mobile_no).await? {
            match self.get(&token).await {
                Ok(session) => sessions.push(session),
                Err(SessionError::NotFound | SessionError::Expired) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sessions)
    }

    /// Logs out every session of a mobile number
    pub async fn force_logout(&self, mobile_no: &str) -> Result<usize> {
        let count = self.logout_others(mobile_no, "").await?;
        info!(mobile_no, count, "Force logged out sessions");
        Ok(count)
    }

    async fn logout_others(&self, mobile_no: &str, keep_token: &str) -> Result<usize> {
        let mut count = 0;
        for token in self.mobile_tokens(mobile_no).await? {
            if token == keep_token {
                continue;
            }
            let logged_out = matches!(self.get_row(&token).await?, Some(row) if !row.is_active);
            if logged_out {
                continue;
            }
            self.delete(&token).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Durable sweep marking expired projections inactive. Approximate: capped scan.
    pub async fn deactivate_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let items = self
            .db
            .scan_all(PartitionKeys::SESSION_SCAN_PREFIX, STATS_SCAN_LIMIT)
            .await?;
        let mut deactivated = 0;

        for item in items {
            let mut row: SessionRow = match item.parse() {
                Ok(row) => row,
                Err(e) => {
                    warn!(pk = %item.pk, error = %e, "Skipping undecodable session row");
                    continue;
                }
            };
            if !row.is_active || now < row.expires_at {
                continue;
            }
            row.is_active = false;
            match row.to_item() {
                Ok(item) => match self.db.put_item(item).await {
                    Ok(()) => deactivated += 1,
                    Err(e) => warn!(session_token = %row.session_token, error = %e, "Failed to deactivate session"),
                },
                Err(e) => warn!(session_token = %row.session_token, error = %e, "Failed to encode session row"),
            }
        }

        if deactivated > 0 {
            info!(deactivated, "Deactivated expired sessions");
        }
        Ok(deactivated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::MemoryDatabase;
    use std::time::Duration;

    struct Fixture {
        cache: Arc<MemoryCache>,
        db: Arc<MemoryDatabase>,
        registry: SessionRegistry,
    }

    fn fixture(config: SessionConfig) -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let db = Arc::new(MemoryDatabase::new());
        let registry = SessionRegistry::new(cache.clone(), db.clone(), config);
        Fixture { cache, db, registry }
    }

    fn session(mobile: &str, device: &str) -> Session {
        Session::new(mobile, mobile, device, "fcm", "jwt-1", Duration::from_secs(3600)).unwrap()
    }

    #[tokio::test]
    async fn test_durable_fallback_refills_cache() {
        let f = fixture(SessionConfig::default());
        let created = f.registry.create(session("5550001", "D1")).await.unwrap();
        let key = RedisKeys::session(&created.session_token);

        f.cache.del(&key).await.unwrap();
        let loaded = f.registry.get(&created.session_token).await.unwrap();
        assert_eq!(loaded.mobile_no, created.mobile_no);
        assert_eq!(loaded.fcm_token, created.fcm_token);
        assert!(f.cache.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_durable_failures_do_not_fail_cache_writes() {
        let f = fixture(SessionConfig::default());
        let created = f.registry.create(session("5550001", "D1")).await.unwrap();

        f.db.set_fail_writes(true);
        let updated = f
            .registry
            .update(
                &created.session_token,
                SessionUpdate {
                    jwt_token: Some("jwt-2".to_string()),
                    user_status: Some("in_game".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.jwt_token, "jwt-2");

        // The durable projection is allowed to lag
        let row: SessionRow = f
            .db
            .get_item(&PartitionKeys::session(&created.session_token), META)
            .await
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(row.jwt_token, "jwt-1");
        assert_eq!(f.registry.get(&created.session_token).await.unwrap().jwt_token, "jwt-2");
    }

    #[tokio::test]
    async fn test_validate_rejects_other_device() {
        let f = fixture(SessionConfig::default());
        let created = f.registry.create(session("5550001", "D1")).await.unwrap();

        assert!(f.registry.validate(&created.session_token, "5550001", "D1").await.is_ok());
        assert!(matches!(
            f.registry.validate(&created.session_token, "5550001", "D2").await,
            Err(SessionError::Mismatch)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_replaces_socket_mapping() {
        let f = fixture(SessionConfig::default());
        let created = f.registry.create(session("5550001", "D1")).await.unwrap();
        let token = created.session_token.as_str();

        f.registry.update_socket_mapping(token, "sockA").await.unwrap();
        f.registry.update_socket_mapping(token, "sockB").await.unwrap();

        assert!(matches!(f.registry.get_by_socket("sockA").await, Err(SessionError::NotFound)));
        assert_eq!(f.registry.get_by_socket("sockB").await.unwrap().session_token, token);
    }

    #[tokio::test]
    async fn test_failed_socket_mapping_leaves_cache_untouched() {
        let f = fixture(SessionConfig::default());
        let created = f.registry.create(session("5550001", "D1")).await.unwrap();
        let token = created.session_token.as_str();
        f.registry.update_socket_mapping(token, "sockA").await.unwrap();

        f.db.set_fail_writes(true);
        assert!(matches!(
            f.registry.update_socket_mapping(token, "sockB").await,
            Err(SessionError::DurableWrite(_))
        ));
        f.db.set_fail_writes(false);

        let cached = f.registry.get(token).await.unwrap();
        assert_eq!(cached.socket_id.as_deref(), Some("sockA"));
        assert_eq!(f.registry.get_by_socket("sockA").await.unwrap().session_token, token);
    }

    #[tokio::test]
    async fn test_removed_mapping_outlives_its_session() {
        let f = fixture(SessionConfig::default());
        let mut lapsed = session("5550001", "D1");
        lapsed.socket_id = Some("sockA".to_string());
        lapsed.expires_at = Utc::now() - chrono::Duration::seconds(1);
        f.registry.create(lapsed).await.unwrap();

        assert!(matches!(f.registry.get_by_socket("sockA").await, Err(SessionError::Expired)));
        let mapping = f.registry.remove_socket_mapping("sockA").await.unwrap().unwrap();
        assert_eq!(mapping.user_id, "5550001");
        assert_eq!(mapping.mobile_no, "5550001");
        assert!(f.registry.remove_socket_mapping("sockA").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logout_and_force_logout() {
        let f = fixture(SessionConfig::default());
        let first = f.registry.create(session("5550001", "D1")).await.unwrap();
        let second = f.registry.create(session("5550001", "D2")).await.unwrap();
        assert_eq!(f.registry.sessions_for_mobile("5550001").await.unwrap().len(), 2);

        f.registry.delete(&first.session_token).await.unwrap();
        assert!(matches!(f.registry.get(&first.session_token).await, Err(SessionError::NotFound)));

        // Only the session still logged in is counted
        assert_eq!(f.registry.force_logout("5550001").await.unwrap(), 1);
        assert!(f.registry.get(&second.session_token).await.is_err());
        assert!(f.registry.sessions_for_mobile("5550001").await.unwrap().is_empty());
        assert_eq!(f.registry.force_logout("5550001").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_session_switch_evicts_older_sessions() {
        let f = fixture(SessionConfig {
            enforce_single_session: true,
            ..Default::default()
        });
        let first = f.registry.create(session("5550001", "D1")).await.unwrap();
        let second = f.registry.create(session("5550001", "D2")).await.unwrap();

        assert!(f.registry.get(&first.session_token).await.is_err());
        assert!(f.registry.get(&second.session_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_deactivate_expired_rows() {
        let f = fixture(SessionConfig::default());
        let mut stale = session("5550001", "D1");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        f.registry.create(stale.clone()).await.unwrap();
        f.registry.create(session("5550002", "D1")).await.unwrap();

        assert_eq!(f.registry.deactivate_expired().await.unwrap(), 1);
        assert_eq!(f.registry.deactivate_expired().await.unwrap(), 0);
    }
}
