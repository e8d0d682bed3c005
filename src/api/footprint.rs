//! `/api/footprint/*`: completed and in-progress
//! footprint candles, plus runtime tick-size overrides.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{parse_interval, AppState, FootprintResponse};
use crate::error::{MarketDataError, Result};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/footprint/historical", get(historical))
        .route("/api/footprint/current", get(current))
        .route("/api/footprint/tick-size", post(set_tick_size))
}

#[derive(Debug, Deserialize)]
struct FootprintQuery {
    provider: String,
    symbol: String,
    interval: String,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoricalResponse {
    candles: Vec<FootprintResponse>,
}

async fn historical(State(state): State<AppState>, Query(query): Query<FootprintQuery>) -> Result<Json<HistoricalResponse>> {
    let interval = parse_interval(&query.interval)?;
    let limit = query.limit.unwrap_or(100);
    let candles = state.hub.footprint().completed(&query.provider, &query.symbol, interval, limit);
    Ok(Json(HistoricalResponse {
        candles: candles.iter().map(FootprintResponse::from).collect(),
    }))
}

async fn current(State(state): State<AppState>, Query(query): Query<FootprintQuery>) -> Result<Json<Option<FootprintResponse>>> {
    let interval = parse_interval(&query.interval)?;
    let candle = state.hub.footprint().current(&query.provider, &query.symbol, interval);
    Ok(Json(candle.as_ref().map(FootprintResponse::from)))
}

#[derive(Debug, Deserialize)]
struct TickSizeQuery {
    symbol: String,
    #[serde(rename = "tickSize")]
    tick_size: Decimal,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ok: bool,
}

async fn set_tick_size(State(state): State<AppState>, Query(query): Query<TickSizeQuery>) -> Result<Json<StatusResponse>> {
    if query.tick_size <= Decimal::ZERO {
        return Err(MarketDataError::InvalidArgument(
            "tickSize must be positive".to_string(),
        ));
    }
    state.hub.footprint().set_tick_size(&query.symbol, query.tick_size);
    Ok(Json(StatusResponse { ok: true }))
}
