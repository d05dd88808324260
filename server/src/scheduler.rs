use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::MatchmakingConfig;
use crate::matchmaking::MatchmakingEngine;
use crate::session_registry::SessionRegistry;

/// Coalescing "run again now" request shared between the scheduler and the
/// handlers that want a faster pass than the fixed interval.
#[derive(Clone, Default)]
pub struct RerunFlag {
    inner: Arc<RerunInner>,
}

#[derive(Default)]
struct RerunInner {
    requested: AtomicBool,
    wake: Notify,
}

impl RerunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any number of requests before the next check collapse into one rerun
    pub fn request(&self) {
        if !self.inner.requested.swap(true, Ordering::AcqRel) {
            self.inner.wake.notify_one();
        }
    }

    /// Clears the flag, returning whether it was set
    pub fn take(&self) -> bool {
        self.inner.requested.swap(false, Ordering::AcqRel)
    }

    /// Resolves once a request is outstanding and consumes it. A wake-up left
    /// over from a request already served is ignored.
    async fn requested(&self) {
        loop {
            self.inner.wake.notified().await;
            if self.take() {
                return;
            }
        }
    }
}

/// Drives matchmaking passes one at a time, plus the periodic cleanup work.
#[derive(Clone)]
pub struct Scheduler {
    engine: Arc<MatchmakingEngine>,
    sessions: Option<Arc<SessionRegistry>>,
    config: MatchmakingConfig,
    rerun: RerunFlag,
}

impl Scheduler {
    pub fn new(engine: Arc<MatchmakingEngine>, config: MatchmakingConfig) -> Self {
        Self {
            engine,
            sessions: None,
            config,
            rerun: RerunFlag::new(),
        }
    }

    /// Also sweep expired durable sessions on the cleanup ticker
    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_rerun_flag(mut self, rerun: RerunFlag) -> Self {
        self.rerun = rerun;
        self
    }

    pub fn rerun_flag(&self) -> RerunFlag {
        self.rerun.clone()
    }

    /// Spawns the scheduler. Cancelling `parent` stops it as well.
    pub fn start(self, parent: &CancellationToken) -> SchedulerHandle {
        let token = parent.child_token();
        let rerun = self.rerun.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move { self.run(task_token).await });

        SchedulerHandle { rerun, token, handle }
    }

    /// Runs until `token` is cancelled. A pass in flight always completes.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!(
            leagues = self.engine.league_ids().len(),
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting matchmaking scheduler"
        );

        tokio::join!(self.run_passes(&token), self.run_cleanup(&token));

        info!("Matchmaking scheduler stopped");
        Ok(())
    }

    async fn run_passes(&self, token: &CancellationToken) {
        loop {
            let results = self.engine.process_matchmaking().await;
            if !results.is_empty() {
                debug!(matches = results.len(), "Matchmaking pass complete");
            }

            if token.is_cancelled() {
                break;
            }
            if self.rerun.take() {
                trace!("Immediate rerun requested");
                continue;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(self.config.interval) => {}
                _ = self.rerun.requested() => {}
            }
        }
    }

    async fn run_cleanup(&self, token: &CancellationToken) {
        let mut ticker = interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.engine.cleanup_expired_matches(self.config.match_max_age).await {
                        error!(error = %e, "Failed to expire old matches");
                    }
                    if let Some(sessions) = &self.sessions {
                        if let Err(e) = sessions.deactivate_expired().await {
                            error!(error = %e, "Failed to deactivate expired sessions");
                        }
                    }
                }
            }
        }
    }
}

pub struct SchedulerHandle {
    rerun: RerunFlag,
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl SchedulerHandle {
    pub fn request_immediate_run(&self) {
        self.rerun.request();
    }

    pub fn rerun_flag(&self) -> RerunFlag {
        self.rerun.clone()
    }

    /// Signals the scheduler and waits for the pass in flight, if any, to finish
    pub async fn stop(self) -> Result<()> {
        self.token.cancel();
        self.handle.await.context("Scheduler task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use std::time::Duration;

    fn scheduler(interval: Duration) -> Scheduler {
        let engine = MatchmakingEngine::new(Arc::new(MemoryDatabase::new()), vec!["3".to_string()]);
        Scheduler::new(
            Arc::new(engine),
            MatchmakingConfig {
                league_ids: vec!["3".to_string()],
                interval,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_rerun_requests_coalesce() {
        let flag = RerunFlag::new();
        flag.request();
        flag.request();
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[tokio::test(start_paused = true)]
    async fn test_served_request_does_not_wake_the_next_wait() {
        let flag = RerunFlag::new();
        // Requested mid-pass, then served by the check after the pass
        flag.request();
        assert!(flag.take());

        let waited = tokio::time::timeout(Duration::from_secs(30), flag.requested()).await;
        assert!(waited.is_err(), "a served request must not cut the next wait short");

        flag.request();
        tokio::time::timeout(Duration::from_secs(1), flag.requested())
            .await
            .expect("a fresh request wakes the wait");
        assert!(!flag.take());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_skips_the_interval_wait() {
        let scheduler = scheduler(Duration::from_secs(60));
        let engine = scheduler.engine.clone();
        let root = CancellationToken::new();
        let handle = scheduler.start(&root);

        // Let the first (empty) pass finish and the loop settle into its wait
        sleep(Duration::from_millis(50)).await;
        engine.manager().join_contest("alice", "3", None).await.unwrap();
        engine.manager().join_contest("bob", "3", None).await.unwrap();
        handle.request_immediate_run();

        let mut matched = false;
        for _ in 0..50 {
            sleep(Duration::from_millis(10)).await;
            if !engine.manager().scan_match_pairs().await.unwrap().is_empty() {
                matched = true;
                break;
            }
        }
        assert!(matched, "pair should be created well before the 60s interval");

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_scheduler() {
        let root = CancellationToken::new();
        let handle = scheduler(Duration::from_secs(2)).start(&root);

        sleep(Duration::from_secs(5)).await;
        root.cancel();
        handle.stop().await.unwrap();
    }
}
