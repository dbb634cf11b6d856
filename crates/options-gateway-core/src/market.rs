//! Market data returned through sessions.
//!
//! Values are opaque to the gateway: prices and Greeks are passed through
//! exactly as the upstream source reports them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MarketDataMode, SessionError};

/// Default number of strikes on each side of the underlying price.
pub const DEFAULT_STRIKE_COUNT: u32 = 20;

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    #[serde(rename = "C")]
    Call,
    #[serde(rename = "P")]
    Put,
}

/// Parameters of an option chain query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRequest {
    /// Underlying symbol, upper-cased.
    pub symbol: String,
    /// Strikes to keep on each side of the underlying price.
    #[serde(default = "default_strike_count")]
    pub strike_count: u32,
    /// Days from today of the wanted expirations. Empty means all.
    #[serde(default)]
    pub expiration_days: Vec<u32>,
}

const fn default_strike_count() -> u32 {
    DEFAULT_STRIKE_COUNT
}

impl ChainRequest {
    /// Create a request for all expirations with the default strike count.
    ///
    /// # Errors
    /// Returns error if the symbol is blank.
    pub fn new(symbol: &str) -> Result<Self, SessionError> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            strike_count: DEFAULT_STRIKE_COUNT,
            expiration_days: Vec::new(),
        })
    }

    /// Set the strike count.
    #[must_use]
    pub const fn with_strike_count(mut self, strike_count: u32) -> Self {
        self.strike_count = strike_count;
        self
    }

    /// Set the wanted expirations, as days from today.
    #[must_use]
    pub fn with_expiration_days(mut self, days: Vec<u32>) -> Self {
        self.expiration_days = days;
        self
    }
}

/// Trim and upper-case a ticker symbol.
///
/// # Errors
/// Returns `InvalidRequest` for blank symbols.
pub fn normalize_symbol(symbol: &str) -> Result<String, SessionError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(SessionError::InvalidRequest("symbol must not be empty".into()));
    }
    Ok(symbol.to_ascii_uppercase())
}

/// Price of an underlying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// One option contract with its market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub symbol: String,
    /// Expiration as `YYYYMMDD`.
    pub expiration: String,
    pub strike: f64,
    pub right: OptionRight,
    pub underlying_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_size: Option<f64>,
    pub volume: Option<f64>,
    pub open_interest: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub implied_vol: Option<f64>,
}

/// Option chain for one underlying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionChain {
    pub symbol: String,
    pub underlying_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub market_data_mode: MarketDataMode,
    pub total_contracts: usize,
    pub calls: usize,
    pub puts: usize,
    /// Distinct expirations, ascending.
    pub expirations: Vec<String>,
    /// Distinct strikes, ascending.
    pub strikes: Vec<f64>,
    /// Contracts sorted by expiration, strike and right.
    pub contracts: Vec<OptionContract>,
}
