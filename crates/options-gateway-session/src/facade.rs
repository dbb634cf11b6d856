//! Public operation surface over the session registry.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use options_gateway_core::{
    ChainRequest, Clock, ConnectionState, GatewayConfig, OptionChain, PriceQuote, SessionConfig,
    SessionError, SessionId, SessionStatus, SourceFactory, TokioClock,
    error::parse_session_id,
    market::normalize_symbol,
};
use serde::Serialize;

use crate::{IdleReaper, Session, SessionRegistry, SessionSummary, UpstreamConnection};

/// Registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_count: usize,
    pub sessions: Vec<SessionSummary>,
}

/// Health of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHealth {
    pub valid: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_state: Option<ConnectionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Server health, optionally with one session's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub server_healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub active_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionHealth>,
}

/// Entry point for every session operation.
#[derive(Clone)]
pub struct SessionFacade {
    registry: Arc<SessionRegistry>,
}

impl SessionFacade {
    /// Wrap an existing registry.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Build a facade with a fresh registry on the tokio clock.
    #[must_use]
    pub fn with_source(
        config: SessionConfig,
        gateway: GatewayConfig,
        factory: Arc<dyn SourceFactory>,
    ) -> Self {
        Self::with_clock(config, gateway, factory, Arc::new(TokioClock))
    }

    /// Build a facade with a fresh registry on the given clock.
    #[must_use]
    pub fn with_clock(
        config: SessionConfig,
        gateway: GatewayConfig,
        factory: Arc<dyn SourceFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(Arc::new(SessionRegistry::new(config, gateway, factory, clock)))
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Reaper bound to this facade's registry.
    #[must_use]
    pub fn reaper(&self) -> IdleReaper {
        IdleReaper::new(Arc::clone(&self.registry))
    }

    /// Open a new session.
    ///
    /// # Errors
    /// Returns `CapacityExceeded` when the active limit is reached.
    pub async fn create_session(&self) -> Result<SessionId, SessionError> {
        self.registry.create().await.map(|s| s.id())
    }

    /// Run `op` against the session's connection.
    ///
    /// The connection is brought up before the caller queues behind other
    /// operations on the session, so concurrent callers share one reconnect
    /// sequence under the configured policy. Operations on one session are
    /// then serialized: `op` runs under the request timeout, transient
    /// upstream failures are retried a bounded number of times, and the
    /// session is touched only when `op` succeeds.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `ConnectionUnavailable`, `RequestTimeout`
    /// or the error produced by `op`.
    pub async fn with_session<T, F, Fut>(&self, session_id: &str, op: F) -> Result<T, SessionError>
    where
        F: Fn(Arc<UpstreamConnection>) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let id = parse_session_id(session_id)?;
        let session = self.registry.get(id).await?;
        Self::connect(&session).await?;
        let _serial = session.serialize().await;

        let config = self.registry.config();
        let mut retries_left = config.transient_retries;
        loop {
            let connection = Self::connect(&session).await?;

            let outcome = match tokio::time::timeout(config.request_timeout, op(connection)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(
                        session_id = %id,
                        timeout_secs = config.request_timeout.as_secs_f64(),
                        "Request timed out"
                    );
                    return Err(SessionError::RequestTimeout(config.request_timeout));
                }
            };

            match outcome {
                Ok(value) => {
                    session.touch(self.registry.clock().now());
                    return Ok(value);
                }
                Err(err) if err.is_transient() && retries_left > 0 => {
                    retries_left -= 1;
                    tracing::debug!(session_id = %id, error = %err, retries_left, "Retrying transient upstream error");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The session's connection, brought up. A connection released under us
    /// means the session was closed.
    async fn connect(session: &Session) -> Result<Arc<UpstreamConnection>, SessionError> {
        let connection = session
            .connection()
            .ok_or_else(|| SessionError::not_found(session.id()))?;
        match connection.ensure_connected().await {
            Ok(()) => Ok(connection),
            Err(_) if session.status() != SessionStatus::Active => {
                Err(SessionError::not_found(session.id()))
            }
            Err(err) => Err(err),
        }
    }

    /// Current price of an underlying.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for a blank symbol, otherwise as
    /// [`Self::with_session`].
    pub async fn get_underlying_price(
        &self,
        session_id: &str,
        symbol: &str,
    ) -> Result<PriceQuote, SessionError> {
        let symbol = normalize_symbol(symbol)?;
        let price = self
            .with_session(session_id, |conn| {
                let symbol = symbol.clone();
                async move { conn.underlying_price(&symbol).await }
            })
            .await?;

        tracing::info!(symbol = %symbol, price, "Fetched underlying price");
        Ok(PriceQuote {
            symbol,
            price,
            timestamp: Utc::now(),
        })
    }

    /// Option chain of an underlying.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for a blank symbol, otherwise as
    /// [`Self::with_session`].
    pub async fn fetch_option_chain(
        &self,
        session_id: &str,
        request: ChainRequest,
    ) -> Result<OptionChain, SessionError> {
        let request = ChainRequest {
            symbol: normalize_symbol(&request.symbol)?,
            ..request
        };
        let chain = self
            .with_session(session_id, |conn| {
                let request = request.clone();
                async move { conn.option_chain(&request).await }
            })
            .await?;

        tracing::info!(
            symbol = %chain.symbol,
            total = chain.total_contracts,
            calls = chain.calls,
            puts = chain.puts,
            "Fetched option chain"
        );
        Ok(chain)
    }

    /// Close a session. Always succeeds; returns whether it existed.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        let Ok(id) = parse_session_id(session_id) else {
            return false;
        };
        let existed = self.registry.remove(id).await;
        if !existed {
            tracing::debug!(session_id = %id, "Delete of unknown session");
        }
        existed
    }

    /// Snapshot of all live sessions.
    pub async fn stats(&self) -> SessionStats {
        let sessions = self.registry.list().await;
        SessionStats {
            active_count: sessions.len(),
            sessions,
        }
    }

    /// Server health and, optionally, one session's connection state.
    ///
    /// Never counts as activity.
    pub async fn health_check(&self, session_id: Option<&str>) -> HealthReport {
        let session = match session_id {
            Some(raw) => Some(self.session_health(raw).await),
            None => None,
        };
        HealthReport {
            server_healthy: true,
            timestamp: Utc::now(),
            active_count: self.registry.active_count().await,
            session,
        }
    }

    async fn session_health(&self, raw: &str) -> SessionHealth {
        let invalid = SessionHealth {
            valid: false,
            connected: false,
            connection_state: None,
            last_error: None,
        };
        let Ok(id) = parse_session_id(raw) else {
            return invalid;
        };
        let Some(session) = self.registry.peek(id).await else {
            return invalid;
        };

        let now = self.registry.clock().now();
        let valid = session.status() == SessionStatus::Active
            && session.idle_for(now) <= self.registry.config().session_timeout;
        match session.connection() {
            Some(conn) if valid => SessionHealth {
                valid,
                connected: conn.is_connected(),
                connection_state: Some(conn.state()),
                last_error: conn.last_error(),
            },
            _ => invalid,
        }
    }

    /// Drain every session. Call once at shutdown.
    pub async fn shutdown(&self) -> usize {
        self.registry.drain().await
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use futures::future::join_all;
    use options_gateway_core::{ErrorKind, ReconnectConfig, ReconnectPolicy};
    use tokio_test::assert_ok;

    use super::*;
    use crate::SimulatedMarket;

    fn config() -> SessionConfig {
        SessionConfig {
            session_timeout: Duration::from_secs(300),
            reaper_interval: Some(Duration::from_secs(60)),
            max_active_sessions: 8,
            request_timeout: Duration::from_secs(10),
            ..SessionConfig::default()
        }
    }

    fn facade_with(config: SessionConfig) -> (SessionFacade, SimulatedMarket) {
        let market = SimulatedMarket::new();
        let facade =
            SessionFacade::with_source(config, GatewayConfig::default(), Arc::new(market.clone()));
        (facade, market)
    }

    fn facade() -> (SessionFacade, SimulatedMarket) {
        facade_with(config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_create_session_ids_are_distinct() {
        let (facade, _) = facade_with(SessionConfig {
            max_active_sessions: 64,
            ..config()
        });

        let ids = join_all((0..64).map(|_| facade.create_session())).await;

        let unique: HashSet<SessionId> = ids.into_iter().map(Result::unwrap).collect();
        assert_eq!(unique.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_then_delete_frees_slot() {
        let (facade, _) = facade_with(SessionConfig {
            max_active_sessions: 2,
            ..config()
        });

        let first = facade.create_session().await.unwrap();
        assert_ok!(facade.create_session().await);

        let err = facade.create_session().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);

        assert!(facade.delete_session(&first.to_string()).await);
        assert_ok!(facade.create_session().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_underlying_price_connects_lazily() {
        let (facade, market) = facade();
        let id = facade.create_session().await.unwrap().to_string();
        assert_eq!(market.connect_count(), 0);

        let quote = facade.get_underlying_price(&id, " spy ").await.unwrap();

        assert_eq!(quote.symbol, "SPY");
        assert_eq!(quote.price, 500.0);
        assert_eq!(market.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_option_chain() {
        let (facade, _) = facade();
        let id = facade.create_session().await.unwrap().to_string();

        let request = ChainRequest::new("QQQ").unwrap().with_strike_count(3);
        let chain = facade.fetch_option_chain(&id, request).await.unwrap();

        assert_eq!(chain.symbol, "QQQ");
        assert_eq!(chain.strikes.len(), 6);
        assert_eq!(chain.total_contracts, chain.contracts.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_symbol_is_invalid() {
        let (facade, market) = facade();
        let id = facade.create_session().await.unwrap().to_string();

        let err = facade.get_underlying_price(&id, "  ").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(market.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session() {
        let (facade, _) = facade();

        let err = facade
            .get_underlying_price(&SessionId::new_v4().to_string(), "SPY")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);

        let err = facade.get_underlying_price("garbage", "SPY").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_scenario() {
        let (facade, _) = facade();
        let _reaper = facade.reaper().spawn();
        let id = facade.create_session().await.unwrap();

        tokio::time::sleep(Duration::from_secs(350)).await;

        let stats = facade.stats().await;
        assert!(stats.sessions.iter().all(|s| s.id != id));
        assert_eq!(stats.active_count, 0);

        let err = facade
            .get_underlying_price(&id.to_string(), "SPY")
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::not_found(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_keeps_session_alive() {
        let (facade, _) = facade();
        let _reaper = facade.reaper().spawn();
        let id = facade.create_session().await.unwrap().to_string();

        // A call every 2 minutes for 20 minutes.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(120)).await;
            assert_ok!(facade.get_underlying_price(&id, "SPY").await);
        }

        let stats = facade.stats().await;
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.sessions[0].id.to_string(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_operation_does_not_touch() {
        let (facade, _) = facade();
        let id = facade.create_session().await.unwrap().to_string();

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(facade.get_underlying_price(&id, "NOSUCH").await.is_err());

        let stats = facade.stats().await;
        assert_eq!(stats.sessions[0].idle_secs, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_is_idempotent() {
        let (facade, market) = facade();
        let id = facade.create_session().await.unwrap().to_string();
        assert_ok!(facade.get_underlying_price(&id, "SPY").await);

        assert!(facade.delete_session(&id).await);
        assert!(!facade.delete_session(&id).await);
        assert!(!facade.delete_session("not-a-uuid").await);
        assert_eq!(market.disconnect_count(), 1);

        let err = facade.get_underlying_price(&id, "SPY").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_does_not_delay_expiry() {
        let (facade, _) = facade();
        let _reaper = facade.reaper().spawn();
        let polled = facade.create_session().await.unwrap();
        let baseline = facade.create_session().await.unwrap();

        let mut saw_valid = false;
        for _ in 0..35 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let report = facade.health_check(Some(&polled.to_string())).await;
            saw_valid |= report.session.is_some_and(|s| s.valid);
        }
        assert!(saw_valid);

        let remaining: Vec<SessionId> = facade.stats().await.sessions.iter().map(|s| s.id).collect();
        assert!(!remaining.contains(&polled));
        assert!(!remaining.contains(&baseline));

        let report = facade.health_check(Some(&polled.to_string())).await;
        assert!(report.server_healthy);
        assert!(!report.session.unwrap().valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_reports_connection() {
        let (facade, _) = facade();
        let id = facade.create_session().await.unwrap().to_string();

        let before = facade.health_check(Some(&id)).await.session.unwrap();
        assert!(before.valid);
        assert!(!before.connected);
        assert_eq!(before.connection_state, Some(ConnectionState::Disconnected));

        assert_ok!(facade.get_underlying_price(&id, "SPY").await);
        let after = facade.health_check(Some(&id)).await;
        assert_eq!(after.active_count, 1);
        assert!(after.session.unwrap().connected);

        assert!(facade.health_check(None).await.session.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let (facade, market) = facade();
        let id = facade.create_session().await.unwrap().to_string();

        market.fail_next_fetches(2);
        assert_ok!(facade.get_underlying_price(&id, "SPY").await);
        assert_eq!(market.fetch_count(), 3);

        market.fail_next_fetches(5);
        let err = facade.get_underlying_price(&id, "SPY").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientUpstreamError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_keeps_session() {
        let (facade, market) = facade();
        let id = facade.create_session().await.unwrap().to_string();
        assert_ok!(facade.get_underlying_price(&id, "SPY").await);

        market.set_fetch_latency(Duration::from_secs(30));
        let err = facade.get_underlying_price(&id, "SPY").await.unwrap_err();
        assert_eq!(err, SessionError::RequestTimeout(Duration::from_secs(10)));

        market.set_fetch_latency(Duration::ZERO);
        assert_ok!(facade.get_underlying_price(&id, "SPY").await);
        assert_eq!(market.connect_count(), 1);
        assert_eq!(market.disconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exclusivity_under_concurrent_use() {
        let (facade, market) = facade_with(SessionConfig {
            reconnect: ReconnectConfig {
                policy: ReconnectPolicy::Wait,
                ..ReconnectConfig::default()
            },
            ..config()
        });
        market.set_connect_latency(Duration::from_secs(2));
        let id = facade.create_session().await.unwrap();
        let id_str = id.to_string();

        let results = join_all((0..10).map(|_| facade.get_underlying_price(&id_str, "SPY"))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(market.connect_count(), 1);
        let session = facade.registry().peek(id).await.unwrap();
        assert_eq!(session.connection().unwrap().reconnect_sequences(), 1);
    }

    async fn concurrent_calls_while_unreachable(policy: ReconnectPolicy) {
        let (facade, market) = facade_with(SessionConfig {
            reconnect: ReconnectConfig {
                policy,
                ..ReconnectConfig::default()
            },
            ..config()
        });
        let id = facade.create_session().await.unwrap();
        let id_str = id.to_string();
        market.fail_next_connects(100);

        let start = tokio::time::Instant::now();
        let results = join_all((0..5).map(|_| facade.get_underlying_price(&id_str, "SPY"))).await;

        assert!(results
            .iter()
            .all(|r| matches!(r, Err(SessionError::ConnectionUnavailable { .. }))));
        let session = facade.registry().peek(id).await.unwrap();
        assert_eq!(session.connection().unwrap().reconnect_sequences(), 1);
        assert_eq!(market.connect_count(), 3);
        // One sequence: 1s then 2s of backoff.
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_gateway_runs_one_sequence_fail_fast() {
        concurrent_calls_while_unreachable(ReconnectPolicy::FailFast).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_gateway_runs_one_sequence_wait() {
        concurrent_calls_while_unreachable(ReconnectPolicy::Wait).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_connect_releases_link() {
        let (facade, market) = facade();
        market.set_connect_latency(Duration::from_secs(5));
        let id = facade.create_session().await.unwrap();
        let connection = facade
            .registry()
            .peek(id)
            .await
            .unwrap()
            .connection()
            .unwrap();

        let pending = tokio::spawn({
            let facade = facade.clone();
            let id = id.to_string();
            async move { facade.get_underlying_price(&id, "SPY").await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(facade.delete_session(&id.to_string()).await);

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, SessionError::not_found(id));
        assert!(connection.is_released());
        assert!(!connection.is_connected());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(market.connect_count(), 1);
        // Once at release, once for the link that came up afterwards.
        assert_eq!(market.disconnect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_severed_link_reconnects_transparently() {
        let (facade, market) = facade();
        let id = facade.create_session().await.unwrap().to_string();
        assert_ok!(facade.get_underlying_price(&id, "SPY").await);

        market.sever_all();
        assert_ok!(facade.get_underlying_price(&id, "SPY").await);

        assert_eq!(market.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_report_json() {
        let (facade, _) = facade();

        let json = serde_json::to_value(facade.health_check(Some("bogus")).await).unwrap();

        assert_eq!(json["server_healthy"], true);
        assert_eq!(json["active_count"], 0);
        assert_eq!(json["session"]["valid"], false);
        assert!(json["session"].get("connection_state").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains() {
        let (facade, market) = facade();
        for _ in 0..3 {
            let id = facade.create_session().await.unwrap().to_string();
            assert_ok!(facade.get_underlying_price(&id, "SPY").await);
        }

        assert_eq!(facade.shutdown().await, 3);
        assert_eq!(facade.stats().await.active_count, 0);
        assert_eq!(market.disconnect_count(), 3);
    }
}
