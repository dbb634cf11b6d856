//! Session lifecycle and upstream gateway configuration.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ConnectParams;

/// Reaper cycles never run more often than this.
pub const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Unknown market data type: {0} (expected live, frozen, delayed, delayed-frozen or 1-4)")]
    MarketDataMode(String),
    #[error("Unknown reconnect policy: {0} (expected fail-fast or wait)")]
    ReconnectPolicy(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Market data type requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketDataMode {
    Live,
    Frozen,
    Delayed,
    #[default]
    DelayedFrozen,
}

impl MarketDataMode {
    /// Numeric code used by the broker API.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Live => 1,
            Self::Frozen => 2,
            Self::Delayed => 3,
            Self::DelayedFrozen => 4,
        }
    }
}

impl fmt::Display for MarketDataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Live => "live",
            Self::Frozen => "frozen",
            Self::Delayed => "delayed",
            Self::DelayedFrozen => "delayed-frozen",
        };
        f.write_str(name)
    }
}

impl FromStr for MarketDataMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "live" | "1" => Ok(Self::Live),
            "frozen" | "2" => Ok(Self::Frozen),
            "delayed" | "3" => Ok(Self::Delayed),
            "delayed-frozen" | "4" => Ok(Self::DelayedFrozen),
            _ => Err(ConfigError::MarketDataMode(s.to_string())),
        }
    }
}

/// What a caller does when it finds a reconnect already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Return `ConnectionUnavailable` immediately.
    #[default]
    FailFast,
    /// Wait for the in-flight sequence, bounded by its worst-case duration.
    Wait,
}

impl FromStr for ReconnectPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fail-fast" => Ok(Self::FailFast),
            "wait" => Ok(Self::Wait),
            _ => Err(ConfigError::ReconnectPolicy(s.to_string())),
        }
    }
}

/// Reconnect behaviour for one upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Attempts per reconnect sequence.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Upper bound for one connect attempt.
    pub connect_timeout: Duration,
    /// Concurrent-caller policy.
    pub policy: ReconnectPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            policy: ReconnectPolicy::FailFast,
        }
    }
}

impl ReconnectConfig {
    /// Delay slept after failed attempt number `attempt` (0-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Worst-case wall time of a full reconnect sequence.
    #[must_use]
    pub fn sequence_budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let sleeping = (0..attempts - 1)
            .map(|n| self.backoff(n))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.connect_timeout
            .saturating_mul(attempts)
            .saturating_add(sleeping)
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Idle time after which a session expires.
    pub session_timeout: Duration,
    /// Maximum number of active sessions.
    pub max_active_sessions: usize,
    /// Reaper period; derived from the timeout when unset.
    pub reaper_interval: Option<Duration>,
    /// Upper bound for one data operation.
    pub request_timeout: Duration,
    /// Internal retries for transient upstream errors.
    pub transient_retries: u32,
    /// Reconnect behaviour of each session's connection.
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(5 * 60),
            max_active_sessions: 32,
            reaper_interval: None,
            request_timeout: Duration::from_secs(60),
            transient_retries: 2,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Effective reaper period: explicit or a fifth of the timeout, never
    /// below [`MIN_REAPER_INTERVAL`].
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        self.reaper_interval
            .unwrap_or(self.session_timeout / 5)
            .max(MIN_REAPER_INTERVAL)
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    /// Returns error on zero timeouts, zero capacity or zero attempts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout.is_zero() {
            return Err(ConfigError::Invalid("session timeout must be positive".into()));
        }
        if self.max_active_sessions == 0 {
            return Err(ConfigError::Invalid("max active sessions must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request timeout must be positive".into()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid("reconnect attempts must be at least 1".into()));
        }
        if self.reconnect.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Upstream gateway settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// First client id; each connection takes the next one.
    pub client_id: i32,
    pub market_data_mode: MarketDataMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7496,
            client_id: 1,
            market_data_mode: MarketDataMode::default(),
        }
    }
}

impl GatewayConfig {
    /// Connect parameters for the connection at `offset`.
    ///
    /// Client ids count up from `client_id` and cycle back to it before
    /// passing `i32::MAX`, so they never overflow into negative ids.
    #[must_use]
    pub fn connect_params(&self, offset: u32, timeout: Duration) -> ConnectParams {
        let base = i64::from(self.client_id);
        let span = i64::from(i32::MAX) - base + 1;
        let client_id = i32::try_from(base + i64::from(offset) % span).unwrap_or(self.client_id);
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            client_id,
            market_data_mode: self.market_data_mode,
            timeout,
        }
    }
}
