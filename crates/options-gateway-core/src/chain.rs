//! Helpers for building option chains from raw upstream data.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use crate::{MarketDataMode, OptionChain, OptionContract, OptionRight};

/// Expiration date format used by the broker API.
pub const EXPIRATION_FORMAT: &str = "%Y%m%d";

/// Select up to `count` strikes on each side of the underlying price.
///
/// With a price, keeps the `count` highest strikes strictly below it and the
/// `count` lowest at or above it. Without one, keeps up to `count` strikes on
/// each side of the middle of the list. The result is ascending and free of
/// duplicates.
#[must_use]
pub fn select_strikes(strikes: &[f64], underlying_price: Option<f64>, count: usize) -> Vec<f64> {
    let mut sorted: Vec<f64> = strikes.iter().copied().filter(|s| s.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();

    match underlying_price.filter(|p| p.is_finite()) {
        Some(price) => {
            let split = sorted.partition_point(|s| *s < price);
            let start = split.saturating_sub(count);
            let end = split.saturating_add(count).min(sorted.len());
            sorted[start..end].to_vec()
        }
        None => {
            let middle = sorted.len() / 2;
            let start = middle.saturating_sub(count);
            let end = middle.saturating_add(count).min(sorted.len());
            sorted[start..end].to_vec()
        }
    }
}

/// Pick the expirations closest to `today + days`.
///
/// An expiration matches an offset when it falls within one calendar day of
/// the target date. When nothing matches, the first `days.len()` expirations
/// are used instead. An empty `days` keeps every expiration. Expirations that
/// do not parse as `YYYYMMDD` are dropped when filtering.
#[must_use]
pub fn match_expirations(expirations: &[String], today: NaiveDate, days: &[u32]) -> Vec<String> {
    let mut sorted = expirations.to_vec();
    sorted.sort();
    sorted.dedup();

    if days.is_empty() {
        return sorted;
    }

    let targets: Vec<NaiveDate> = days
        .iter()
        .filter_map(|d| today.checked_add_signed(TimeDelta::days(i64::from(*d))))
        .collect();

    let matched: Vec<String> = sorted
        .iter()
        .filter(|exp| {
            NaiveDate::parse_from_str(exp, EXPIRATION_FORMAT).is_ok_and(|date| {
                targets
                    .iter()
                    .any(|target| (date - *target).num_days().abs() <= 1)
            })
        })
        .cloned()
        .collect();

    if matched.is_empty() {
        sorted.into_iter().take(days.len()).collect()
    } else {
        matched
    }
}

impl OptionChain {
    /// Build a chain from unordered contracts, computing the summary fields.
    #[must_use]
    pub fn assemble(
        symbol: impl Into<String>,
        underlying_price: Option<f64>,
        market_data_mode: MarketDataMode,
        mut contracts: Vec<OptionContract>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        contracts.sort_by(|a, b| {
            a.expiration
                .cmp(&b.expiration)
                .then(a.strike.total_cmp(&b.strike))
                .then(a.right.cmp(&b.right))
        });

        let calls = contracts
            .iter()
            .filter(|c| c.right == OptionRight::Call)
            .count();

        let mut expirations: Vec<String> = contracts.iter().map(|c| c.expiration.clone()).collect();
        expirations.dedup();

        let mut strikes: Vec<f64> = contracts.iter().map(|c| c.strike).collect();
        strikes.sort_by(f64::total_cmp);
        strikes.dedup();

        Self {
            symbol: symbol.into(),
            underlying_price,
            timestamp,
            market_data_mode,
            total_contracts: contracts.len(),
            calls,
            puts: contracts.len() - calls,
            expirations,
            strikes,
            contracts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, EXPIRATION_FORMAT).unwrap()
    }

    fn contract(expiration: &str, strike: f64, right: OptionRight) -> OptionContract {
        OptionContract {
            symbol: "SPY".into(),
            expiration: expiration.into(),
            strike,
            right,
            underlying_price: Some(500.0),
            bid: None,
            ask: None,
            last: None,
            bid_size: None,
            ask_size: None,
            volume: None,
            open_interest: None,
            delta: None,
            gamma: None,
            theta: None,
            vega: None,
            implied_vol: None,
        }
    }

    #[test]
    fn test_select_strikes_around_price() {
        let strikes: Vec<f64> = (90..=110).map(f64::from).collect();
        let selected = select_strikes(&strikes, Some(100.5), 2);
        assert_eq!(selected, vec![99.0, 100.0, 101.0, 102.0]);
    }

    #[test]
    fn test_select_strikes_price_on_strike_counts_above() {
        let strikes = [98.0, 99.0, 100.0, 101.0, 102.0];
        let selected = select_strikes(&strikes, Some(100.0), 1);
        assert_eq!(selected, vec![99.0, 100.0]);
    }

    #[test]
    fn test_select_strikes_near_edge() {
        let strikes = [100.0, 105.0, 95.0, 105.0];
        let selected = select_strikes(&strikes, Some(96.0), 10);
        assert_eq!(selected, vec![95.0, 100.0, 105.0]);
    }

    #[test]
    fn test_select_strikes_without_price_uses_middle() {
        let strikes: Vec<f64> = (1..=10).map(f64::from).collect();
        let selected = select_strikes(&strikes, None, 2);
        assert_eq!(selected, vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_match_expirations_within_one_day() {
        let today = date("20240101");
        let expirations = vec![
            "20240119".to_string(),
            "20240102".to_string(),
            "20240108".to_string(),
            "20240216".to_string(),
        ];

        // 7 days -> Jan 8 (exact), 17 days -> Jan 19 (one day off)
        let matched = match_expirations(&expirations, today, &[7, 17]);
        assert_eq!(matched, vec!["20240108", "20240119"]);
    }

    #[test]
    fn test_match_expirations_falls_back_to_earliest() {
        let today = date("20240101");
        let expirations = vec!["20240301".to_string(), "20240201".to_string()];

        let matched = match_expirations(&expirations, today, &[3]);
        assert_eq!(matched, vec!["20240201"]);
    }

    #[test]
    fn test_match_expirations_empty_keeps_all() {
        let today = date("20240101");
        let expirations = vec!["20240301".to_string(), "20240201".to_string()];

        let matched = match_expirations(&expirations, today, &[]);
        assert_eq!(matched, vec!["20240201", "20240301"]);
    }

    #[test]
    fn test_assemble_sorts_and_counts() {
        let contracts = vec![
            contract("20240216", 500.0, OptionRight::Put),
            contract("20240119", 505.0, OptionRight::Call),
            contract("20240119", 500.0, OptionRight::Put),
            contract("20240119", 500.0, OptionRight::Call),
        ];

        let chain = OptionChain::assemble(
            "SPY",
            Some(502.0),
            MarketDataMode::Delayed,
            contracts,
            Utc::now(),
        );

        assert_eq!(chain.total_contracts, 4);
        assert_eq!(chain.calls, 2);
        assert_eq!(chain.puts, 2);
        assert_eq!(chain.expirations, vec!["20240119", "20240216"]);
        assert_eq!(chain.strikes, vec![500.0, 505.0]);
        assert_eq!(chain.contracts[0].right, OptionRight::Call);
        assert_eq!(chain.contracts[1].right, OptionRight::Put);
        assert_eq!(chain.contracts[2].strike, 505.0);
    }
}
