use anyhow::Result;
use common::CLUSTER_RENEWAL_INTERVAL_MS;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;

pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Runs a service on at most one server at a time, guarded by a TTL'd lease in
/// the cache tier.
///
/// The lease value is this server's id. It is claimed with set-if-absent and
/// kept alive by an owner-checked renewal; a server that fails to renew stops
/// its service before anyone else can claim the expired lease.
///
/// `cancellation_token` is the server shutdown signal. Cancelling it stops the
/// running service (through a child token) and ends `run`.
pub struct ClusterSingleton {
    cache: Arc<dyn CacheStore>,
    server_id: u64,
    lease_key: String,
    lease_duration: Duration,
    renew_interval: Duration,
    is_leader: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
}

impl ClusterSingleton {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        server_id: u64,
        lease_key: String,
        lease_duration: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            cache,
            server_id,
            lease_key,
            lease_duration,
            renew_interval: Duration::from_millis(CLUSTER_RENEWAL_INTERVAL_MS),
            is_leader: Arc::new(AtomicBool::new(false)),
            cancellation_token,
        }
    }

    /// Must stay well below the lease duration
    pub fn with_renew_interval(mut self, renew_interval: Duration) -> Self {
        self.renew_interval = renew_interval;
        self
    }

    /// Shared view of the leadership state that outlives `run`
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        self.is_leader.clone()
    }

    /// Returns true if this instance is currently running the service
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Runs `user_service` whenever this server holds the lease.
    ///
    /// The service receives a token that is cancelled on shutdown or when the
    /// lease is lost, and is expected to return promptly after that.
    pub async fn run(self, user_service: impl Fn(CancellationToken) -> ServiceFuture) -> Result<()> {
        info!(server_id = self.server_id, lease_key = %self.lease_key, "Starting cluster singleton");

        let mut renew_interval = interval(self.renew_interval);
        renew_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut service_handle: Option<JoinHandle<Result<()>>> = None;
        let mut service_token: Option<CancellationToken> = None;
        let mut rng = StdRng::from_entropy();

        let mut claim_sleep = Box::pin(sleep(Duration::from_millis(rng.gen_range(500..=1500))));

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!(lease_key = %self.lease_key, "Cluster singleton shutdown received");
                    self.is_leader.store(false, Ordering::Release);
                    self.stop_service(&mut service_token, &mut service_handle).await;
                    break;
                }
                _ = &mut claim_sleep => {
                    if !self.is_leader() {
                        match self.try_acquire_lease().await {
                            Ok(true) => {
                                info!(server_id = self.server_id, lease_key = %self.lease_key, "Became leader");
                                self.is_leader.store(true, Ordering::Release);

                                if service_handle.is_none() {
                                    let token = self.cancellation_token.child_token();
                                    service_token = Some(token.clone());
                                    service_handle = Some(tokio::spawn(user_service(token)));
                                }
                            }
                            Ok(false) => {
                                debug!(lease_key = %self.lease_key, "Lease held by another server");
                            }
                            Err(e) => {
                                warn!(lease_key = %self.lease_key, error = %e, "Error trying to acquire lease");
                            }
                        }
                    }

                    claim_sleep = Box::pin(sleep(Duration::from_millis(rng.gen_range(500..=1500))));
                }
                _ = renew_interval.tick() => {
                    if self.is_leader() {
                        match self.renew_lease().await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(lease_key = %self.lease_key, "Lost leadership, lease renewal refused");
                                self.is_leader.store(false, Ordering::Release);
                                self.stop_service(&mut service_token, &mut service_handle).await;
                            }
                            Err(e) => {
                                error!(lease_key = %self.lease_key, error = %e, "Error renewing lease");
                                self.is_leader.store(false, Ordering::Release);
                                self.stop_service(&mut service_token, &mut service_handle).await;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn try_acquire_lease(&self) -> Result<bool> {
        self.cache
            .set_nx_px(&self.lease_key, &self.server_id.to_string(), self.lease_duration)
            .await
    }

    async fn renew_lease(&self) -> Result<bool> {
        self.cache
            .renew_if_owner(&self.lease_key, &self.server_id.to_string(), self.lease_duration)
            .await
    }

    async fn stop_service(
        &self,
        service_token: &mut Option<CancellationToken>,
        service_handle: &mut Option<JoinHandle<Result<()>>>,
    ) {
        if let Some(token) = service_token.take() {
            debug!("Cancelling service token");
            token.cancel();
        }

        if let Some(handle) = service_handle.take() {
            debug!("Waiting for service to shut down gracefully");
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(Ok(()))) => info!(lease_key = %self.lease_key, "Service shut down gracefully"),
                Ok(Ok(Err(e))) => error!(error = ?e, "Service returned error"),
                Ok(Err(e)) => error!(error = ?e, "Service task panicked"),
                Err(_) => warn!("Service shutdown timed out after 10 seconds"),
            }
        }
    }
}
