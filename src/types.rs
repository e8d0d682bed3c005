//! Core data model: Candle, Trade, OrderBookSnapshot,
//! BookTickerSnapshot, PriceLevelVolume and FootprintCandle.
//!
//! Numeric wire fields use `rust_decimal::Decimal` for precision but are
//! serialized as JSON numbers (`serde-float` feature) rather than strings, so
//! downstream chart clients get precise wicks without string-parsing.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::time::Interval;

/// Composite key shared by the trade/orderbook/bookticker stores:
/// `provider_symbol`.
pub fn stream_key(provider: &str, symbol: &str) -> String {
    format!("{provider}_{symbol}")
}

/// Composite key shared by the candle/footprint stores:
/// `provider_symbol_interval`.
pub fn candle_key(provider: &str, symbol: &str, interval: Interval) -> String {
    format!("{provider}_{symbol}_{}", interval.label())
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// OHLC bar aggregated over a fixed interval. Identity is
/// `(provider, symbol, interval, open_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub provider: String,
    pub interval: Interval,
    /// Epoch seconds, aligned to `interval` via `Interval::bucket_start`.
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_asset_volume: Decimal,
    pub number_of_trades: u64,
    pub closed: bool,
}

impl Candle {
    pub fn key(&self) -> String {
        candle_key(&self.provider, &self.symbol, self.interval)
    }

    /// `high >= max(open, close) >= min(open, close) >= low`.
    pub fn is_well_formed(&self) -> bool {
        let hi = self.open.max(self.close);
        let lo = self.open.min(self.close);
        self.high >= hi && hi >= lo && lo >= self.low
    }

    /// Fold a single tick price into this candle (used by the ticker
    /// scheduler and the mock provider's per-tick update).
    pub fn apply_tick(&mut self, price: Decimal, volume_delta: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume_delta;
        self.quote_asset_volume += volume_delta * price;
        self.number_of_trades += 1;
    }

    pub fn open_time_dt(&self) -> DateTime<Utc> {
        millis_to_datetime(self.open_time * 1000)
    }

    pub fn close_time_dt(&self) -> DateTime<Utc> {
        millis_to_datetime(self.close_time * 1000)
    }
}

/// A single executed trade. Append-only; dedup key is `(timestamp, price, quantity)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub provider: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    /// `true` when the taker bought (aggressive buy).
    pub aggressive_buy: bool,
    pub trade_id: Option<u64>,
}

impl Trade {
    pub fn key(&self) -> String {
        stream_key(&self.provider, &self.symbol)
    }

    /// Dedup signature: `(timestamp, price, quantity)`.
    pub fn signature(&self) -> (i64, Decimal, Decimal) {
        (self.timestamp, self.price, self.quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQty {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Full order-book depth snapshot: bids descending, asks ascending by price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub provider: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub bids: Vec<PriceQty>,
    pub asks: Vec<PriceQty>,
}

impl OrderBookSnapshot {
    pub fn key(&self) -> String {
        stream_key(&self.provider, &self.symbol)
    }

    pub fn depth(&self) -> usize {
        self.bids.len().max(self.asks.len())
    }
}

/// Sentinel used for imbalance when `ask_qty == 0`. Callers computing
/// averages must filter values `>= 100`.
pub const IMBALANCE_SENTINEL: f64 = 999.0;

/// Best bid/ask snapshot with derived spread/imbalance analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTickerSnapshot {
    pub symbol: String,
    pub provider: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub best_bid: PriceQty,
    pub best_ask: PriceQty,
}

impl BookTickerSnapshot {
    pub fn key(&self) -> String {
        stream_key(&self.provider, &self.symbol)
    }

    pub fn spread(&self) -> Decimal {
        self.best_ask.price - self.best_bid.price
    }

    pub fn spread_bps(&self) -> f64 {
        let bid = self.best_bid.price;
        if bid.is_zero() {
            return 0.0;
        }
        let spread = self.spread();
        (spread / bid * Decimal::from(10_000)).to_f64().unwrap_or(0.0)
    }

    /// `bidQty / askQty`, capped at `IMBALANCE_SENTINEL` when `askQty == 0`.
    pub fn imbalance(&self) -> f64 {
        if self.best_ask.quantity.is_zero() {
            return IMBALANCE_SENTINEL;
        }
        let bid = self.best_bid.quantity.to_f64().unwrap_or(0.0);
        let ask = self.best_ask.quantity.to_f64().unwrap_or(1.0);
        bid / ask
    }
}

/// Per-tick-aligned-price buy/sell volume inside a footprint candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevelVolume {
    pub price: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub trade_count: u64,
}

impl PriceLevelVolume {
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            trade_count: 0,
        }
    }

    pub fn total(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }

    pub fn delta(&self) -> Decimal {
        self.buy_volume - self.sell_volume
    }

    pub fn buy_ratio(&self) -> f64 {
        let total = self.total();
        if total.is_zero() {
            return 0.0;
        }
        (self.buy_volume / total).to_f64().unwrap_or(0.0)
    }
}

/// A Candle augmented with a per-price-level buy/sell volume profile.
/// `volume_profile` is keyed by tick-aligned price so the map is naturally
/// ordered ascending by price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FootprintCandle {
    pub candle: Candle,
    pub total_buy_volume: Decimal,
    pub total_sell_volume: Decimal,
    pub delta: Decimal,
    /// Per-candle cumulative delta. See DESIGN.md for the Open Question
    /// resolution: this crate keeps cumulative delta per-(symbol,interval)
    /// with an explicit reset on the first candle of a trading day (UTC).
    pub cumulative_delta: Decimal,
    pub volume_profile: BTreeMap<Decimal, PriceLevelVolume>,
    pub point_of_control: Option<Decimal>,
    pub value_area_high: Option<Decimal>,
    pub value_area_low: Option<Decimal>,
}
