//! In-process simulated market.
//!
//! Generates deterministic quotes and chains without a broker gateway, and
//! exposes counters and failure switches so lifecycle behaviour can be
//! exercised end to end.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, TimeDelta, Utc, Weekday};
use options_gateway_core::{
    ChainRequest, ConnectParams, MarketDataMode, MarketDataSource, OptionChain, OptionContract,
    OptionRight, SourceFactory, UpstreamError,
    chain::{EXPIRATION_FORMAT, match_expirations, select_strikes},
};
use parking_lot::Mutex;

/// Strikes listed on each side of the spot price.
const LISTED_STRIKES_PER_SIDE: i32 = 60;
/// Weekly expirations listed.
const LISTED_EXPIRATIONS: i64 = 8;

#[derive(Default)]
struct MarketState {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fetches: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_fetches: AtomicUsize,
    failing_disconnects: AtomicBool,
    generation: AtomicU64,
    connect_latency: Mutex<Duration>,
    fetch_latency: Mutex<Duration>,
    prices: Mutex<HashMap<String, f64>>,
}

/// Take one unit from a failure budget, if any is left.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Simulated market shared by every source it creates.
#[derive(Clone)]
pub struct SimulatedMarket {
    state: Arc<MarketState>,
}

impl Default for SimulatedMarket {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMarket {
    /// Create a market with a few liquid underlyings listed.
    #[must_use]
    pub fn new() -> Self {
        let market = Self {
            state: Arc::new(MarketState::default()),
        };
        {
            let mut prices = market.state.prices.lock();
            prices.insert("SPY".into(), 500.0);
            prices.insert("QQQ".into(), 430.0);
            prices.insert("AAPL".into(), 190.0);
            prices.insert("SPX".into(), 5000.0);
        }
        market
    }

    /// List an underlying at `price`.
    #[must_use]
    pub fn with_price(self, symbol: &str, price: f64) -> Self {
        self.state
            .prices
            .lock()
            .insert(symbol.to_ascii_uppercase(), price);
        self
    }

    /// Connect calls made by all sources.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Disconnect calls made by all sources.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Data requests made by all sources.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` data requests time out.
    pub fn fail_next_fetches(&self, n: usize) {
        self.state.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Make disconnect calls report an error.
    pub fn fail_disconnects(&self, fail: bool) {
        self.state.failing_disconnects.store(fail, Ordering::SeqCst);
    }

    /// Delay every connect call.
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.state.connect_latency.lock() = latency;
    }

    /// Delay every data request.
    pub fn set_fetch_latency(&self, latency: Duration) {
        *self.state.fetch_latency.lock() = latency;
    }

    /// Drop every open link, as a gateway restart would.
    pub fn sever_all(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl SourceFactory for SimulatedMarket {
    fn create(&self) -> Box<dyn MarketDataSource> {
        Box::new(SimulatedSource {
            state: Arc::clone(&self.state),
            link: Mutex::new(None),
        })
    }
}

#[derive(Clone, Copy)]
struct Link {
    generation: u64,
    mode: MarketDataMode,
}

struct SimulatedSource {
    state: Arc<MarketState>,
    link: Mutex<Option<Link>>,
}

impl SimulatedSource {
    fn live_link(&self) -> Option<Link> {
        let generation = self.state.generation.load(Ordering::SeqCst);
        (*self.link.lock()).filter(|link| link.generation == generation)
    }

    async fn begin_request(&self) -> Result<Link, UpstreamError> {
        let latency = *self.state.fetch_latency.lock();
        tokio::time::sleep(latency).await;
        self.state.fetches.fetch_add(1, Ordering::SeqCst);

        let link = self
            .live_link()
            .ok_or_else(|| UpstreamError::Disconnected("not connected to gateway".into()))?;
        if take_one(&self.state.failing_fetches) {
            return Err(UpstreamError::Timeout("market data request timed out".into()));
        }
        Ok(link)
    }

    fn price_of(&self, symbol: &str) -> Result<f64, UpstreamError> {
        self.state
            .prices
            .lock()
            .get(&symbol.to_ascii_uppercase())
            .copied()
            .ok_or_else(|| UpstreamError::NotFound(format!("no security definition for {symbol}")))
    }
}

#[async_trait]
impl MarketDataSource for SimulatedSource {
    async fn connect(&self, params: &ConnectParams) -> Result<(), UpstreamError> {
        let latency = *self.state.connect_latency.lock();
        tokio::time::sleep(latency).await;
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.state.failing_connects) {
            return Err(UpstreamError::Disconnected(format!(
                "connection to {}:{} refused",
                params.host, params.port
            )));
        }

        *self.link.lock() = Some(Link {
            generation: self.state.generation.load(Ordering::SeqCst),
            mode: params.market_data_mode,
        });
        tracing::debug!(
            host = %params.host,
            port = params.port,
            client_id = params.client_id,
            "Simulated gateway connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), UpstreamError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.link.lock().take();
        if self.state.failing_disconnects.load(Ordering::SeqCst) {
            return Err(UpstreamError::Disconnected("socket already closed".into()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.live_link().is_some()
    }

    async fn underlying_price(&self, symbol: &str) -> Result<f64, UpstreamError> {
        self.begin_request().await?;
        self.price_of(symbol)
    }

    async fn option_chain(&self, request: &ChainRequest) -> Result<OptionChain, UpstreamError> {
        let link = self.begin_request().await?;
        let spot = self.price_of(&request.symbol)?;
        let today = Utc::now().date_naive();

        let step = strike_step(spot);
        let atm = (spot / step).round() * step;
        let listed: Vec<f64> = (-LISTED_STRIKES_PER_SIDE..=LISTED_STRIKES_PER_SIDE)
            .map(|n| f64::from(n).mul_add(step, atm))
            .filter(|strike| *strike > 0.0)
            .collect();
        let strikes = select_strikes(&listed, Some(spot), request.strike_count as usize);
        let expirations =
            match_expirations(&weekly_expirations(today), today, &request.expiration_days);

        let mut contracts = Vec::with_capacity(expirations.len() * strikes.len() * 2);
        for expiration in &expirations {
            let days = NaiveDate::parse_from_str(expiration, EXPIRATION_FORMAT)
                .map(|date| (date - today).num_days().max(0))
                .unwrap_or(0);
            for strike in &strikes {
                for right in [OptionRight::Call, OptionRight::Put] {
                    contracts.push(quote(&request.symbol, expiration, *strike, right, spot, days));
                }
            }
        }

        if contracts.is_empty() {
            return Err(UpstreamError::NotFound(format!(
                "no option contracts listed for {}",
                request.symbol
            )));
        }

        Ok(OptionChain::assemble(
            request.symbol.clone(),
            Some(spot),
            link.mode,
            contracts,
            Utc::now(),
        ))
    }
}

fn strike_step(spot: f64) -> f64 {
    if spot >= 1000.0 {
        25.0
    } else if spot >= 200.0 {
        5.0
    } else if spot >= 25.0 {
        2.5
    } else {
        1.0
    }
}

fn weekly_expirations(today: NaiveDate) -> Vec<String> {
    let to_friday = (i64::from(Weekday::Fri.num_days_from_monday()) + 7
        - i64::from(today.weekday().num_days_from_monday()))
        % 7;
    (0..LISTED_EXPIRATIONS)
        .filter_map(|week| today.checked_add_signed(TimeDelta::days(to_friday + week * 7)))
        .map(|date| date.format(EXPIRATION_FORMAT).to_string())
        .collect()
}

fn quote(
    symbol: &str,
    expiration: &str,
    strike: f64,
    right: OptionRight,
    spot: f64,
    days: i64,
) -> OptionContract {
    let intrinsic = match right {
        OptionRight::Call => (spot - strike).max(0.0),
        OptionRight::Put => (strike - spot).max(0.0),
    };
    #[allow(clippy::cast_precision_loss)]
    let time_value = spot * 0.002 * ((days + 1) as f64).sqrt();
    let mid = ((intrinsic + time_value) * 100.0).round() / 100.0;
    let spread = (mid * 0.02).max(0.01);

    OptionContract {
        symbol: symbol.to_string(),
        expiration: expiration.to_string(),
        strike,
        right,
        underlying_price: Some(spot),
        bid: Some(((mid - spread / 2.0).max(0.0) * 100.0).round() / 100.0),
        ask: Some(((mid + spread / 2.0) * 100.0).round() / 100.0),
        last: Some(mid),
        bid_size: Some(10.0),
        ask_size: Some(10.0),
        volume: None,
        open_interest: None,
        delta: None,
        gamma: None,
        theta: None,
        vega: None,
        implied_vol: None,
    }
}
