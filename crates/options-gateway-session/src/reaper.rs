//! Background expiry of idle sessions.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use options_gateway_core::SessionId;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{Session, SessionRegistry};

/// Outcome of one reaping cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Sessions expired and removed.
    pub expired: Vec<SessionId>,
    /// Expired sessions whose connection failed to disconnect cleanly.
    pub release_failures: usize,
}

/// Periodic task expiring sessions idle past the timeout.
pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl IdleReaper {
    /// Reaper running at the registry's configured interval.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let interval = registry.config().reaper_interval();
        Self { registry, interval }
    }

    /// Override the interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Run a single cycle.
    ///
    /// Sessions are pre-filtered on a snapshot, then re-checked under the
    /// registry lock before removal. A failed disconnect is logged and the
    /// cycle moves on.
    pub async fn reap_once(&self) -> ReapReport {
        let mut report = ReapReport::default();

        for session in self.stale_candidates().await {
            let id = session.id();
            let Some(expired) = self.registry.expire_idle(id).await else {
                tracing::debug!(session_id = %id, "Session active again, skipping");
                continue;
            };

            tracing::info!(
                session_id = %id,
                idle_secs = expired.idle_for(self.registry.clock().now()).as_secs(),
                "Session expired"
            );
            if let Err(err) = self.registry.release(&expired).await {
                tracing::warn!(session_id = %id, error = %err, "Error disconnecting expired session");
                report.release_failures += 1;
            }
            report.expired.push(id);
        }

        report
    }

    /// Sessions idle past the timeout as of a registry snapshot. Any of them
    /// may be touched before removal re-checks it.
    async fn stale_candidates(&self) -> Vec<Arc<Session>> {
        let timeout = self.registry.config().session_timeout;
        let now = self.registry.clock().now();
        self.registry
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.idle_for(now) > timeout)
            .collect()
    }

    /// Start the periodic task.
    #[must_use]
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.interval.as_secs_f64(),
                timeout_secs = self.registry.config().session_timeout.as_secs(),
                "Starting idle session reaper"
            );
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match AssertUnwindSafe(self.reap_once()).catch_unwind().await {
                            Ok(report) if !report.expired.is_empty() => {
                                tracing::info!(
                                    expired = report.expired.len(),
                                    release_failures = report.release_failures,
                                    "Reaped idle sessions"
                                );
                            }
                            Ok(_) => {}
                            Err(_) => tracing::error!("Reaper cycle panicked; continuing"),
                        }
                    }
                }
            }
            tracing::info!("Idle session reaper stopped");
        });

        ReaperHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running reaper.
pub struct ReaperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use options_gateway_core::{GatewayConfig, SessionConfig, SessionStatus, TokioClock};

    use super::*;
    use crate::SimulatedMarket;

    fn registry(market: &SimulatedMarket) -> Arc<SessionRegistry> {
        let config = SessionConfig {
            session_timeout: Duration::from_secs(300),
            reaper_interval: Some(Duration::from_secs(60)),
            ..SessionConfig::default()
        };
        Arc::new(SessionRegistry::new(
            config,
            GatewayConfig::default(),
            Arc::new(market.clone()),
            Arc::new(TokioClock),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_once_expires_only_idle() {
        let market = SimulatedMarket::new();
        let registry = registry(&market);
        let reaper = IdleReaper::new(Arc::clone(&registry));

        let idle = registry.create().await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        let busy = registry.create().await.unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;

        let report = reaper.reap_once().await;

        assert_eq!(report.expired, vec![idle.id()]);
        assert_eq!(idle.status(), SessionStatus::Closed);
        assert_eq!(busy.status(), SessionStatus::Active);
        assert!(registry.peek(idle.id()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_after_scan_saves_session() {
        let market = SimulatedMarket::new();
        let registry = registry(&market);
        let reaper = IdleReaper::new(Arc::clone(&registry));

        let session = registry.create().await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;

        let stale = reaper.stale_candidates().await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id(), session.id());

        // An operation lands between the scan and the removal.
        assert!(session.touch(registry.clock().now()));

        assert!(registry.expire_idle(session.id()).await.is_none());
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(registry.peek(session.id()).await.is_some());
        assert!(reaper.reap_once().await.expired.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_continues_past_release_failures() {
        let market = SimulatedMarket::new();
        let registry = registry(&market);
        let reaper = IdleReaper::new(Arc::clone(&registry));

        for _ in 0..3 {
            let session = registry.create().await.unwrap();
            session.connection().unwrap().ensure_connected().await.unwrap();
        }
        market.fail_disconnects(true);
        tokio::time::advance(Duration::from_secs(301)).await;

        let report = reaper.reap_once().await;

        assert_eq!(report.expired.len(), 3);
        assert_eq!(report.release_failures, 3);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_runs_on_interval() {
        let market = SimulatedMarket::new();
        let registry = registry(&market);
        let handle = IdleReaper::new(Arc::clone(&registry)).spawn();

        let session = registry.create().await.unwrap();

        // Idle for exactly the timeout at the 300s tick: not yet expired.
        tokio::time::sleep(Duration::from_secs(330)).await;
        assert!(registry.peek(session.id()).await.is_some());

        // The 360s tick sees it idle past the timeout.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(registry.peek(session.id()).await.is_none());
        assert_eq!(session.status(), SessionStatus::Closed);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_task() {
        let market = SimulatedMarket::new();
        let registry = registry(&market);
        let handle = IdleReaper::new(registry).with_interval(Duration::from_secs(5)).spawn();
        assert!(!handle.is_finished());

        handle.shutdown().await;
    }
}
