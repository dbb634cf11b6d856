//! Core traits for upstream market data access.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{ChainRequest, MarketDataMode, OptionChain};

/// Session identifier.
pub type SessionId = Uuid;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is usable.
    Active,
    /// Session exceeded its idle timeout and is being reclaimed.
    Expired,
    /// Session was released. Terminal.
    Closed,
}

impl SessionStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Expired | Self::Closed) | (Self::Expired, Self::Closed)
        )
    }
}

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Parameters for opening one upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Gateway host.
    pub host: String,
    /// Gateway port.
    pub port: u16,
    /// Client id, unique per concurrent connection.
    pub client_id: i32,
    /// Market data type requested after connecting.
    pub market_data_mode: MarketDataMode,
    /// Upper bound for a single connect attempt.
    pub timeout: Duration,
}

/// Error reported by a market data source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Upstream timed out: {0}")]
    Timeout(String),
    #[error("Upstream disconnected: {0}")]
    Disconnected(String),
}

impl UpstreamError {
    /// Timeouts and dropped links may succeed on retry; the rest will not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Disconnected(_))
    }
}

/// Trait for market data sources backed by one physical gateway connection.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Open the connection.
    async fn connect(&self, params: &ConnectParams) -> Result<(), UpstreamError>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), UpstreamError>;

    /// Whether the physical link is currently up.
    fn is_connected(&self) -> bool;

    /// Last price of an underlying symbol.
    async fn underlying_price(&self, symbol: &str) -> Result<f64, UpstreamError>;

    /// Option chain for an underlying symbol.
    async fn option_chain(&self, request: &ChainRequest) -> Result<OptionChain, UpstreamError>;
}

/// Trait for creating one market data source per session.
pub trait SourceFactory: Send + Sync {
    /// Create a fresh, disconnected source.
    fn create(&self) -> Box<dyn MarketDataSource>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use SessionStatus::{Active, Closed, Expired};

        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Closed));
        assert!(Expired.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Active));
    }

    #[test]
    fn test_upstream_error_classification() {
        assert!(UpstreamError::Timeout("slow".into()).is_transient());
        assert!(UpstreamError::Disconnected("eof".into()).is_transient());
        assert!(!UpstreamError::NotFound("XYZ".into()).is_transient());
        assert!(!UpstreamError::Rejected("bad".into()).is_transient());
    }

    #[test]
    fn test_connection_state_serialization() {
        let json = serde_json::to_string(&ConnectionState::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
    }
}
