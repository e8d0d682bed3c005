//! Process-wide configuration, loaded once at bootstrap via
//! `Config::from_env()`: env vars, `unwrap_or_else` defaults, no external
//! config-file crate.

use std::collections::HashMap;
use std::env;

use rust_decimal::Decimal;

use crate::time::Interval;

#[derive(Debug, Clone)]
pub struct Config {
    pub default_provider: String,
    pub default_interval: Interval,

    pub mock_ticker_ms: u64,
    pub mock_default_volatility: f64,
    pub mock_scenario: String,
    pub symbol_tick_sizes: HashMap<String, Decimal>,
    pub default_tick_size: Decimal,

    pub candle_max: usize,
    pub trade_max: usize,
    pub order_book_max: usize,
    pub book_ticker_max: usize,

    pub order_book_interval_s: i64,
    pub book_ticker_interval_ms: i64,

    pub bind_addr: String,

    /// Symbols to subscribe on the default provider at startup, standing in
    /// for the union of symbols external strategy collaborators would
    /// declare (strategies themselves are out of scope here).
    pub bootstrap_symbols: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: "mock".to_string(),
            default_interval: Interval::OneMinute,
            mock_ticker_ms: 100,
            mock_default_volatility: 0.001,
            mock_scenario: "NORMAL".to_string(),
            symbol_tick_sizes: HashMap::new(),
            default_tick_size: Decimal::new(1, 2), // 0.01
            candle_max: 1_000,
            trade_max: 1_000_000,
            order_book_max: 1_000,
            book_ticker_max: 3_600,
            order_book_interval_s: 10,
            book_ticker_interval_ms: 1_000,
            bind_addr: "0.0.0.0:3000".to_string(),
            bootstrap_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("DEFAULT_PROVIDER") {
            config.default_provider = v;
        }
        if let Ok(v) = env::var("DEFAULT_INTERVAL") {
            if let Ok(interval) = Interval::parse(&v) {
                config.default_interval = interval;
            }
        }
        if let Ok(v) = env::var("MOCK_TICKER_MS") {
            config.mock_ticker_ms = v.parse().unwrap_or(config.mock_ticker_ms);
        }
        if let Ok(v) = env::var("MOCK_DEFAULT_VOLATILITY") {
            config.mock_default_volatility = v.parse().unwrap_or(config.mock_default_volatility);
        }
        if let Ok(v) = env::var("MOCK_SCENARIO") {
            config.mock_scenario = v;
        }
        if let Ok(v) = env::var("SYMBOL_TICK_SIZES") {
            config.symbol_tick_sizes = parse_tick_sizes(&v);
        }
        if let Ok(v) = env::var("DEFAULT_TICK_SIZE") {
            if let Ok(d) = v.parse::<Decimal>() {
                config.default_tick_size = d;
            }
        }
        if let Ok(v) = env::var("CANDLE_MAX") {
            config.candle_max = v.parse().unwrap_or(config.candle_max);
        }
        if let Ok(v) = env::var("TRADE_MAX") {
            config.trade_max = v.parse().unwrap_or(config.trade_max);
        }
        if let Ok(v) = env::var("ORDER_BOOK_MAX") {
            config.order_book_max = v.parse().unwrap_or(config.order_book_max);
        }
        if let Ok(v) = env::var("BOOK_TICKER_MAX") {
            config.book_ticker_max = v.parse().unwrap_or(config.book_ticker_max);
        }
        if let Ok(v) = env::var("ORDER_BOOK_INTERVAL_S") {
            config.order_book_interval_s = v.parse().unwrap_or(config.order_book_interval_s);
        }
        if let Ok(v) = env::var("BOOK_TICKER_INTERVAL_MS") {
            config.book_ticker_interval_ms = v.parse().unwrap_or(config.book_ticker_interval_ms);
        }
        if let Ok(v) = env::var("BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Ok(v) = env::var("BOOTSTRAP_SYMBOLS") {
            config.bootstrap_symbols = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config
    }

    pub fn tick_size_for(&self, symbol: &str) -> Decimal {
        self.symbol_tick_sizes
            .get(symbol)
            .copied()
            .unwrap_or(self.default_tick_size)
    }
}

/// Parses `"BTCUSDT:0.01,ETHUSDT:0.001"` into a symbol -> tick size map.
fn parse_tick_sizes(raw: &str) -> HashMap<String, Decimal> {
    raw.split(',')
        .filter_map(|entry| {
            let (symbol, tick) = entry.split_once(':')?;
            let tick: Decimal = tick.trim().parse().ok()?;
            Some((symbol.trim().to_string(), tick))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_caps() {
        let config = Config::default();
        assert_eq!(config.candle_max, 1_000);
        assert_eq!(config.trade_max, 1_000_000);
        assert_eq!(config.order_book_max, 1_000);
        assert_eq!(config.book_ticker_max, 3_600);
        assert_eq!(config.order_book_interval_s, 10);
        assert_eq!(config.book_ticker_interval_ms, 1_000);
    }

    #[test]
    fn parses_tick_size_overrides() {
        let map = parse_tick_sizes("BTCUSDT:0.01,ETHUSDT:0.001");
        assert_eq!(map["BTCUSDT"], Decimal::new(1, 2));
        assert_eq!(map["ETHUSDT"], Decimal::new(1, 3));
    }

    #[test]
    fn default_bootstrap_symbols_nonempty() {
        assert!(!Config::default().bootstrap_symbols.is_empty());
    }
}
