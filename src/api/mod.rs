//! REST surface: trading/providers, footprint and order-flow
//! analytics, plus the WebSocket push endpoint. Each submodule exposes a
//! `routes()` function returning a `Router<AppState>` merged together in
//! `main.rs`.

pub mod footprint;
pub mod orderflow;
pub mod trading;
pub mod ws;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dispatch::DispatchHub;
use crate::types::{Candle, FootprintCandle};

/// Shared axum state: a single `Arc<DispatchHub>` gives every handler access
/// to the provider registry, the four stores and the footprint engine.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<DispatchHub>,
}

/// Wire shape for a candle: decimals ride as JSON numbers and
/// time is represented three ways (ISO-8601, epoch seconds, epoch millis) so
/// chart clients can pick whichever they parse fastest.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleResponse {
    pub symbol: String,
    pub provider: String,
    pub interval: String,
    pub closed: bool,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub time: i64,
    pub timestamp: i64,
    pub time_ms: i64,
    pub open: rust_decimal::Decimal,
    pub high: rust_decimal::Decimal,
    pub low: rust_decimal::Decimal,
    pub close: rust_decimal::Decimal,
    pub volume: rust_decimal::Decimal,
    pub quote_asset_volume: rust_decimal::Decimal,
    pub number_of_trades: u64,
}

impl From<&Candle> for CandleResponse {
    fn from(c: &Candle) -> Self {
        Self {
            symbol: c.symbol.clone(),
            provider: c.provider.clone(),
            interval: c.interval.label().to_string(),
            closed: c.closed,
            open_time: c.open_time_dt(),
            close_time: c.close_time_dt(),
            time: c.open_time,
            timestamp: c.open_time,
            time_ms: c.open_time * 1000,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            quote_asset_volume: c.quote_asset_volume,
            number_of_trades: c.number_of_trades,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FootprintResponse {
    pub candle: CandleResponse,
    pub total_buy_volume: rust_decimal::Decimal,
    pub total_sell_volume: rust_decimal::Decimal,
    pub delta: rust_decimal::Decimal,
    pub cumulative_delta: rust_decimal::Decimal,
    pub volume_profile: Vec<crate::types::PriceLevelVolume>,
    pub point_of_control: Option<rust_decimal::Decimal>,
    pub value_area_high: Option<rust_decimal::Decimal>,
    pub value_area_low: Option<rust_decimal::Decimal>,
}

impl From<&FootprintCandle> for FootprintResponse {
    fn from(f: &FootprintCandle) -> Self {
        Self {
            candle: CandleResponse::from(&f.candle),
            total_buy_volume: f.total_buy_volume,
            total_sell_volume: f.total_sell_volume,
            delta: f.delta,
            cumulative_delta: f.cumulative_delta,
            volume_profile: f.volume_profile.values().copied().collect(),
            point_of_control: f.point_of_control,
            value_area_high: f.value_area_high,
            value_area_low: f.value_area_low,
        }
    }
}

pub(crate) fn parse_interval(raw: &str) -> Result<crate::time::Interval, crate::error::MarketDataError> {
    crate::time::Interval::parse(raw)
}
