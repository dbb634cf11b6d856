//! Command line and environment configuration.

use std::time::Duration;

use clap::Parser;
use options_gateway_core::{
    GatewayConfig, MarketDataMode, ReconnectConfig, ReconnectPolicy, SessionConfig,
    config::ConfigError,
};

/// Session-based option market data gateway
#[derive(Parser, Debug)]
#[command(name = "options-gateway", version, about)]
pub struct Cli {
    /// Listen address
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Broker gateway host
    #[arg(long, env = "IBKR_HOST", default_value = "127.0.0.1")]
    pub ibkr_host: String,

    /// Broker gateway port
    #[arg(long, env = "IBKR_PORT", default_value_t = 7496)]
    pub ibkr_port: u16,

    /// Base client id; each session connects with its own offset from it
    #[arg(long, env = "IBKR_CLIENT_ID", default_value_t = 1)]
    pub ibkr_client_id: i32,

    /// Connect timeout in seconds
    #[arg(long, env = "IBKR_TIMEOUT", default_value_t = 30)]
    pub ibkr_timeout: u64,

    /// Market data type: live, frozen, delayed, delayed-frozen or 1-4
    #[arg(long, env = "MARKET_DATA_TYPE", default_value = "delayed-frozen")]
    pub market_data_type: MarketDataMode,

    /// Idle minutes before a session expires
    #[arg(long, env = "SESSION_TIMEOUT_MINUTES", default_value_t = 5)]
    pub session_timeout_minutes: u64,

    /// Seconds between idle session sweeps
    #[arg(long, env = "SESSION_CLEANUP_INTERVAL_SECONDS", default_value_t = 60)]
    pub session_cleanup_interval_seconds: u64,

    /// Maximum concurrently active sessions
    #[arg(long, env = "MAX_ACTIVE_SESSIONS", default_value_t = 32)]
    pub max_active_sessions: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value_t = 60)]
    pub request_timeout_seconds: u64,

    /// Reconnect policy when a reconnect is already running: fail-fast or wait
    #[arg(long, env = "RECONNECT_POLICY", default_value = "fail-fast")]
    pub reconnect_policy: ReconnectPolicy,

    /// Retries of transient upstream errors per request
    #[arg(long, env = "TRANSIENT_RETRIES", default_value_t = 2)]
    pub transient_retries: u32,

    /// Strikes on each side of the price when a chain request leaves it out
    #[arg(long, env = "DEFAULT_STRIKE_COUNT", default_value_t = 20)]
    pub default_strike_count: u32,
}

impl Cli {
    /// Session lifecycle settings.
    ///
    /// # Errors
    /// Returns error if the settings are inconsistent.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let timeout_secs = self
            .session_timeout_minutes
            .checked_mul(60)
            .ok_or_else(|| ConfigError::Invalid("session timeout is too large".into()))?;
        let config = SessionConfig {
            session_timeout: Duration::from_secs(timeout_secs),
            max_active_sessions: self.max_active_sessions,
            reaper_interval: Some(Duration::from_secs(self.session_cleanup_interval_seconds)),
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            transient_retries: self.transient_retries,
            reconnect: ReconnectConfig {
                connect_timeout: Duration::from_secs(self.ibkr_timeout),
                policy: self.reconnect_policy,
                ..ReconnectConfig::default()
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Upstream gateway settings.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            host: self.ibkr_host.clone(),
            port: self.ibkr_port,
            client_id: self.ibkr_client_id,
            market_data_mode: self.market_data_type,
        }
    }

    /// Address to listen on.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["options-gateway"]);
        let config = cli.session_config().unwrap();

        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.reaper_interval(), Duration::from_secs(60));
        assert_eq!(config.reconnect.policy, ReconnectPolicy::FailFast);
        assert_eq!(cli.gateway_config().market_data_mode, MarketDataMode::DelayedFrozen);
    }

    #[test]
    fn test_flags_override() {
        let cli = Cli::parse_from([
            "options-gateway",
            "--session-timeout-minutes",
            "10",
            "--market-data-type",
            "1",
            "--reconnect-policy",
            "wait",
            "--ibkr-port",
            "4002",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
        ]);
        assert_eq!(cli.listen_addr(), "127.0.0.1:9000");

        let config = cli.session_config().unwrap();
        assert_eq!(config.session_timeout, Duration::from_secs(600));
        assert_eq!(config.reconnect.policy, ReconnectPolicy::Wait);

        let gateway = cli.gateway_config();
        assert_eq!(gateway.market_data_mode, MarketDataMode::Live);
        assert_eq!(gateway.port, 4002);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Cli::try_parse_from(["options-gateway", "--market-data-type", "realtime"]).is_err());

        let cli = Cli::parse_from(["options-gateway", "--max-active-sessions", "0"]);
        assert!(cli.session_config().is_err());

        let cli = Cli::parse_from([
            "options-gateway",
            "--session-timeout-minutes",
            u64::MAX.to_string().as_str(),
        ]);
        assert_eq!(
            cli.session_config().unwrap_err(),
            ConfigError::Invalid("session timeout is too large".into())
        );
    }
}
