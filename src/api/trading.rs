//! `/api/trading/*`: provider discovery, connect, ticker and
//! kline subscription, and historical candle fetch.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{parse_interval, AppState, CandleResponse};
use crate::error::Result;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/trading/providers", get(list_providers))
        .route("/api/trading/intervals/:provider", get(intervals))
        .route("/api/trading/connect/:provider", post(connect))
        .route("/api/trading/subscribe/:provider/:symbol", post(subscribe_ticker))
        .route(
            "/api/trading/subscribe/klines/:provider/:symbol/:interval",
            post(subscribe_kline).delete(unsubscribe_kline),
        )
        .route("/api/trading/historical/:provider/:symbol/:interval", get(historical))
}

#[derive(Debug, Serialize)]
struct ProvidersResponse {
    providers: Vec<crate::dispatch::ProviderStatus>,
}

async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: state.hub.list_providers(),
    })
}

#[derive(Debug, Serialize)]
struct IntervalsResponse {
    intervals: Vec<String>,
}

async fn intervals(State(state): State<AppState>, Path(provider): Path<String>) -> Result<Json<IntervalsResponse>> {
    let intervals = state.hub.intervals(&provider)?;
    Ok(Json(IntervalsResponse {
        intervals: intervals.iter().map(|i| i.label().to_string()).collect(),
    }))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ok: bool,
}

async fn connect(State(state): State<AppState>, Path(provider): Path<String>) -> Result<Json<StatusResponse>> {
    state.hub.connect(&provider).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn subscribe_ticker(
    State(state): State<AppState>,
    Path((provider, symbol)): Path<(String, String)>,
) -> Result<Json<StatusResponse>> {
    state.hub.subscribe_ticker(&provider, &symbol).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn subscribe_kline(
    State(state): State<AppState>,
    Path((provider, symbol, interval)): Path<(String, String, String)>,
) -> Result<Json<StatusResponse>> {
    let interval = parse_interval(&interval)?;
    state.hub.subscribe_kline(&provider, &symbol, interval).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn unsubscribe_kline(
    State(state): State<AppState>,
    Path((provider, symbol, interval)): Path<(String, String, String)>,
) -> Result<Json<StatusResponse>> {
    let interval = parse_interval(&interval)?;
    state.hub.unsubscribe_kline(&provider, &symbol, interval).await?;
    Ok(Json(StatusResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
struct HistoricalQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoricalResponse {
    candles: Vec<CandleResponse>,
}

async fn historical(
    State(state): State<AppState>,
    Path((provider, symbol, interval)): Path<(String, String, String)>,
    Query(query): Query<HistoricalQuery>,
) -> Result<Json<HistoricalResponse>> {
    let interval = parse_interval(&interval)?;
    let limit = query.limit.unwrap_or(500);
    let candles = state.hub.historical_klines(&provider, &symbol, interval, limit).await?;
    Ok(Json(HistoricalResponse {
        candles: candles.iter().map(CandleResponse::from).collect(),
    }))
}
