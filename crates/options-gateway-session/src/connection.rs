//! Upstream connection with exclusive, bounded reconnection.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
};

use options_gateway_core::{
    ChainRequest, ConnectParams, ConnectionState, MarketDataSource, OptionChain, ReconnectConfig,
    ReconnectPolicy, SessionError, UpstreamError,
};
use parking_lot::Mutex;
use tokio::sync::MutexGuard;

const RELEASED: &str = "connection released";

fn released_error() -> SessionError {
    SessionError::ConnectionUnavailable {
        attempts: 0,
        reason: RELEASED.to_string(),
    }
}

struct LinkStatus {
    state: ConnectionState,
    last_error: Option<String>,
    /// Set once by `disconnect`; the link never comes back up afterwards.
    released: bool,
}

/// One physical connection to the broker gateway.
///
/// Reconnect sequences are serialized by `reconnect_gate`; normal data
/// requests never take it.
pub struct UpstreamConnection {
    source: Box<dyn MarketDataSource>,
    params: ConnectParams,
    reconnect: ReconnectConfig,
    status: Mutex<LinkStatus>,
    reconnect_gate: tokio::sync::Mutex<()>,
    sequences: AtomicU64,
    completed: AtomicU64,
}

impl UpstreamConnection {
    /// Wrap a disconnected source.
    #[must_use]
    pub fn new(
        source: Box<dyn MarketDataSource>,
        params: ConnectParams,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            source,
            params,
            reconnect,
            status: Mutex::new(LinkStatus {
                state: ConnectionState::Disconnected,
                last_error: None,
                released: false,
            }),
            reconnect_gate: tokio::sync::Mutex::new(()),
            sequences: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    /// Reason of the last failure, cleared by a successful connect.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.status.lock().last_error.clone()
    }

    /// Upstream client id of this connection.
    #[must_use]
    pub const fn client_id(&self) -> i32 {
        self.params.client_id
    }

    /// Whether the link is up, both by our bookkeeping and the source's.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.source.is_connected()
    }

    /// Number of reconnect sequences started so far.
    #[must_use]
    pub fn reconnect_sequences(&self) -> u64 {
        self.sequences.load(Ordering::SeqCst)
    }

    /// Whether `disconnect` has released this connection for good.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.status.lock().released
    }

    /// Record a state change. Once released, only `Disconnected` is accepted
    /// and `false` is returned for anything else.
    fn set_state(&self, state: ConnectionState, error: Option<&UpstreamError>) -> bool {
        let mut status = self.status.lock();
        if status.released && state != ConnectionState::Disconnected {
            return false;
        }
        status.state = state;
        match (state, error) {
            (_, Some(err)) => status.last_error = Some(err.to_string()),
            (ConnectionState::Connected, None) => status.last_error = None,
            _ => {}
        }
        true
    }

    /// Connect with a single attempt. No-op when already connected.
    ///
    /// # Errors
    /// Returns `ConnectionUnavailable` if the attempt fails.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            return Ok(());
        }
        let _gate = self.reconnect_gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if self.is_released() {
            return Err(released_error());
        }
        self.attempt()
            .await
            .map_err(|err| SessionError::ConnectionUnavailable {
                attempts: 1,
                reason: err.to_string(),
            })
    }

    /// Make sure the link is up before a data request.
    ///
    /// Runs at most one reconnect sequence at a time per connection. A caller
    /// that finds one in flight follows the configured [`ReconnectPolicy`].
    ///
    /// # Errors
    /// Returns `ConnectionUnavailable` when the sequence exhausts its attempts,
    /// or immediately under the fail-fast policy while another caller is
    /// reconnecting.
    pub async fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.is_released() {
            return Err(released_error());
        }

        let seen = self.completed.load(Ordering::SeqCst);
        let gate = self.acquire_gate().await?;
        if self.is_connected() {
            return Ok(());
        }
        if self.is_released() {
            return Err(released_error());
        }
        if self.completed.load(Ordering::SeqCst) != seen {
            // A sequence finished while we waited and did not bring the link up.
            return Err(SessionError::ConnectionUnavailable {
                attempts: self.reconnect.max_attempts,
                reason: self
                    .last_error()
                    .unwrap_or_else(|| "reconnect failed".to_string()),
            });
        }

        let result = self.reconnect_sequence().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        drop(gate);
        result
    }

    async fn acquire_gate(&self) -> Result<MutexGuard<'_, ()>, SessionError> {
        if let Ok(gate) = self.reconnect_gate.try_lock() {
            return Ok(gate);
        }
        match self.reconnect.policy {
            ReconnectPolicy::FailFast => Err(SessionError::ConnectionUnavailable {
                attempts: 0,
                reason: "reconnect already in progress".to_string(),
            }),
            ReconnectPolicy::Wait => {
                let budget = self.reconnect.sequence_budget();
                tokio::time::timeout(budget, self.reconnect_gate.lock())
                    .await
                    .map_err(|_| SessionError::ConnectionUnavailable {
                        attempts: 0,
                        reason: format!(
                            "timed out after {}s waiting for reconnect",
                            budget.as_secs()
                        ),
                    })
            }
        }
    }

    async fn reconnect_sequence(&self) -> Result<(), SessionError> {
        self.sequences.fetch_add(1, Ordering::SeqCst);
        let attempts = self.reconnect.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if self.is_released() {
                return Err(released_error());
            }
            if attempt > 0 {
                let delay = self.reconnect.backoff(attempt - 1);
                tracing::debug!(
                    client_id = self.params.client_id,
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs_f64(),
                    "Backing off before reconnect"
                );
                tokio::time::sleep(delay).await;
                if self.is_released() {
                    return Err(released_error());
                }
            }

            match self.attempt().await {
                Ok(()) => {
                    tracing::info!(
                        client_id = self.params.client_id,
                        attempt = attempt + 1,
                        "Connected to gateway"
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        client_id = self.params.client_id,
                        attempt = attempt + 1,
                        error = %err,
                        "Gateway connect attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(SessionError::ConnectionUnavailable {
            attempts,
            reason: last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string()),
        })
    }

    async fn attempt(&self) -> Result<(), UpstreamError> {
        if !self.set_state(ConnectionState::Connecting, None) {
            return Err(UpstreamError::Disconnected(RELEASED.into()));
        }
        let result = match tokio::time::timeout(
            self.reconnect.connect_timeout,
            self.source.connect(&self.params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(format!(
                "connect to {}:{} timed out",
                self.params.host, self.params.port
            ))),
        };

        match &result {
            Ok(()) => {
                if !self.set_state(ConnectionState::Connected, None) {
                    // Released while connecting: close the link just opened.
                    if let Err(err) = self.source.disconnect().await {
                        tracing::warn!(
                            client_id = self.params.client_id,
                            error = %err,
                            "Error closing link opened after release"
                        );
                    }
                    return Err(UpstreamError::Disconnected(RELEASED.into()));
                }
            }
            Err(err) => {
                self.set_state(ConnectionState::Failed, Some(err));
            }
        }
        result
    }

    /// Price of an underlying.
    ///
    /// # Errors
    /// Returns transient or permanent upstream errors.
    pub async fn underlying_price(&self, symbol: &str) -> Result<f64, SessionError> {
        self.call(self.source.underlying_price(symbol)).await
    }

    /// Option chain of an underlying.
    ///
    /// # Errors
    /// Returns transient or permanent upstream errors.
    pub async fn option_chain(&self, request: &ChainRequest) -> Result<OptionChain, SessionError> {
        self.call(self.source.option_chain(request)).await
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, UpstreamError>>,
    ) -> Result<T, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::TransientUpstream("not connected to gateway".into()));
        }
        match request.await {
            Ok(value) => Ok(value),
            Err(err) => {
                if matches!(err, UpstreamError::Disconnected(_)) {
                    self.set_state(ConnectionState::Failed, Some(&err));
                }
                Err(err.into())
            }
        }
    }

    /// Release the connection, best-effort. It always ends up disconnected
    /// and is never reconnected afterwards; a connect still in flight closes
    /// its link instead of publishing it.
    ///
    /// # Errors
    /// Returns the source's failure so callers can log it.
    pub async fn disconnect(&self) -> Result<(), UpstreamError> {
        let was = {
            let mut status = self.status.lock();
            status.released = true;
            std::mem::replace(&mut status.state, ConnectionState::Disconnected)
        };
        let result = if was == ConnectionState::Disconnected && !self.source.is_connected() {
            Ok(())
        } else {
            self.source.disconnect().await
        };

        if let Err(err) = &result {
            self.set_state(ConnectionState::Disconnected, Some(err));
        }
        tracing::debug!(client_id = self.params.client_id, "Disconnected from gateway");
        result
    }
}
