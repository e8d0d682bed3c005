//! `/api/orderflow/*`: trade, order-book and book-ticker subscription
//! management plus their historical/analytics reads.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::dispatch::OrderflowIncludes;
use crate::error::{MarketDataError, Result};
use crate::types::{BookTickerSnapshot, OrderBookSnapshot, Trade};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/orderflow/subscribe/trades",
            post(subscribe_trades).delete(unsubscribe_trades),
        )
        .route(
            "/api/orderflow/subscribe/aggregate-trades",
            post(subscribe_aggregate_trades).delete(unsubscribe_aggregate_trades),
        )
        .route(
            "/api/orderflow/subscribe/orderbook",
            post(subscribe_order_book).delete(unsubscribe_order_book),
        )
        .route(
            "/api/orderflow/subscribe/book-ticker",
            post(subscribe_book_ticker).delete(unsubscribe_book_ticker),
        )
        .route("/api/orderflow/subscribe/all", post(subscribe_all))
        .route("/api/orderflow/historical/trades/:provider/:symbol", get(trades))
        .route("/api/orderflow/historical/trades/:provider/:symbol/latest", get(latest_trade))
        .route("/api/orderflow/historical/orderbook/:provider/:symbol", get(order_book))
        .route("/api/orderflow/historical/orderbook/:provider/:symbol/latest", get(latest_order_book))
        .route("/api/orderflow/historical/orderbook/:provider/:symbol/at/:time", get(order_book_at))
        .route(
            "/api/orderflow/historical/orderbook/:provider/:symbol/config/:field",
            post(order_book_config),
        )
        .route("/api/orderflow/historical/bookticker/:provider/:symbol", get(book_ticker))
        .route("/api/orderflow/historical/bookticker/:provider/:symbol/latest", get(latest_book_ticker))
        .route(
            "/api/orderflow/historical/bookticker/:provider/:symbol/anomalies",
            get(book_ticker_anomalies),
        )
        .route("/api/orderflow/historical/bookticker/:provider/:symbol/stats", get(book_ticker_stats))
        .route("/api/orderflow/historical/:provider/:symbol", delete(clear))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct ProviderSymbolQuery {
    provider: String,
    symbol: String,
}

async fn subscribe_trades(State(state): State<AppState>, Query(q): Query<ProviderSymbolQuery>) -> Result<Json<StatusResponse>> {
    state.hub.subscribe_trades(&q.provider, &q.symbol).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn unsubscribe_trades(State(state): State<AppState>, Query(q): Query<ProviderSymbolQuery>) -> Result<Json<StatusResponse>> {
    state.hub.unsubscribe_trades(&q.provider, &q.symbol).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn subscribe_aggregate_trades(State(state): State<AppState>, Query(q): Query<ProviderSymbolQuery>) -> Result<Json<StatusResponse>> {
    state.hub.subscribe_aggregate_trades(&q.provider, &q.symbol).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn unsubscribe_aggregate_trades(State(state): State<AppState>, Query(q): Query<ProviderSymbolQuery>) -> Result<Json<StatusResponse>> {
    state.hub.unsubscribe_aggregate_trades(&q.provider, &q.symbol).await?;
    Ok(Json(StatusResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
struct OrderBookSubscribeQuery {
    provider: String,
    symbol: String,
    depth: Option<u32>,
}

async fn subscribe_order_book(State(state): State<AppState>, Query(q): Query<OrderBookSubscribeQuery>) -> Result<Json<StatusResponse>> {
    let depth = q.depth.unwrap_or(20);
    state.hub.subscribe_order_book(&q.provider, &q.symbol, depth).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn unsubscribe_order_book(State(state): State<AppState>, Query(q): Query<ProviderSymbolQuery>) -> Result<Json<StatusResponse>> {
    state.hub.unsubscribe_order_book(&q.provider, &q.symbol).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn subscribe_book_ticker(State(state): State<AppState>, Query(q): Query<ProviderSymbolQuery>) -> Result<Json<StatusResponse>> {
    state.hub.subscribe_book_ticker(&q.provider, &q.symbol).await?;
    Ok(Json(StatusResponse { ok: true }))
}

async fn unsubscribe_book_ticker(State(state): State<AppState>, Query(q): Query<ProviderSymbolQuery>) -> Result<Json<StatusResponse>> {
    state.hub.unsubscribe_book_ticker(&q.provider, &q.symbol).await?;
    Ok(Json(StatusResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
struct SubscribeAllQuery {
    provider: String,
    symbol: String,
    #[serde(default)]
    trades: Option<bool>,
    #[serde(rename = "aggregateTrades", default)]
    aggregate_trades: Option<bool>,
    #[serde(rename = "orderBook", default)]
    order_book: Option<bool>,
    #[serde(rename = "bookTicker", default)]
    book_ticker: Option<bool>,
}

async fn subscribe_all(State(state): State<AppState>, Query(q): Query<SubscribeAllQuery>) -> Result<Json<StatusResponse>> {
    let defaults = OrderflowIncludes::default();
    let includes = OrderflowIncludes {
        trades: q.trades.unwrap_or(defaults.trades),
        aggregate_trades: q.aggregate_trades.unwrap_or(defaults.aggregate_trades),
        order_book: q.order_book.unwrap_or(defaults.order_book),
        book_ticker: q.book_ticker.unwrap_or(defaults.book_ticker),
    };
    state.hub.subscribe_all_orderflow(&q.provider, &q.symbol, includes).await?;
    Ok(Json(StatusResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
struct HistoricalQuery {
    count: Option<usize>,
    #[serde(rename = "startTime")]
    start_time: Option<i64>,
    #[serde(rename = "endTime")]
    end_time: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TradesResponse {
    trades: Vec<Trade>,
}

async fn trades(
    State(state): State<AppState>,
    Path((provider, symbol)): Path<(String, String)>,
    Query(query): Query<HistoricalQuery>,
) -> Json<TradesResponse> {
    let trades = match (query.start_time, query.end_time) {
        (Some(start), Some(end)) => state.hub.trades().range(&provider, &symbol, start, end),
        _ => match query.count {
            Some(count) => state.hub.trades().last_n(&provider, &symbol, count),
            None => state.hub.trades().get(&provider, &symbol),
        },
    };
    Json(TradesResponse { trades })
}

async fn latest_trade(State(state): State<AppState>, Path((provider, symbol)): Path<(String, String)>) -> Json<Option<Trade>> {
    Json(state.hub.trades().last_n(&provider, &symbol, 1).into_iter().next())
}

#[derive(Debug, Serialize)]
struct OrderBooksResponse {
    snapshots: Vec<OrderBookSnapshot>,
}

async fn order_book(
    State(state): State<AppState>,
    Path((provider, symbol)): Path<(String, String)>,
    Query(query): Query<HistoricalQuery>,
) -> Json<OrderBooksResponse> {
    let snapshots = match (query.start_time, query.end_time) {
        (Some(start), Some(end)) => state.hub.order_books().range(&provider, &symbol, start, end),
        _ => match query.count {
            Some(count) => state.hub.order_books().last_n(&provider, &symbol, count),
            None => state.hub.order_books().get(&provider, &symbol),
        },
    };
    Json(OrderBooksResponse { snapshots })
}

async fn latest_order_book(State(state): State<AppState>, Path((provider, symbol)): Path<(String, String)>) -> Json<Option<OrderBookSnapshot>> {
    Json(state.hub.order_books().latest(&provider, &symbol))
}

async fn order_book_at(
    State(state): State<AppState>,
    Path((provider, symbol, time)): Path<(String, String, String)>,
) -> Result<Json<Option<OrderBookSnapshot>>> {
    let time_ms = parse_iso8601_ms(&time)?;
    Ok(Json(state.hub.order_books().at(&provider, &symbol, time_ms)))
}

#[derive(Debug, Deserialize)]
struct ConfigValueQuery {
    value: i64,
}

async fn order_book_config(
    State(state): State<AppState>,
    Path((_provider, _symbol, field)): Path<(String, String, String)>,
    Query(query): Query<ConfigValueQuery>,
) -> Result<Json<StatusResponse>> {
    match field.as_str() {
        "interval" => state.hub.set_order_book_interval_s(query.value),
        "max" => {
            if query.value < 0 {
                return Err(MarketDataError::InvalidArgument("max must be non-negative".to_string()));
            }
            state.hub.set_order_book_max(query.value as usize);
        }
        other => return Err(MarketDataError::InvalidArgument(format!("unknown config field '{other}'"))),
    }
    Ok(Json(StatusResponse { ok: true }))
}

#[derive(Debug, Serialize)]
struct BookTickersResponse {
    snapshots: Vec<BookTickerSnapshot>,
}

async fn book_ticker(
    State(state): State<AppState>,
    Path((provider, symbol)): Path<(String, String)>,
    Query(query): Query<HistoricalQuery>,
) -> Json<BookTickersResponse> {
    let snapshots = match (query.start_time, query.end_time) {
        (Some(start), Some(end)) => state.hub.book_tickers().range(&provider, &symbol, start, end),
        _ => match query.count {
            Some(count) => state.hub.book_tickers().last_n(&provider, &symbol, count),
            None => state.hub.book_tickers().get(&provider, &symbol),
        },
    };
    Json(BookTickersResponse { snapshots })
}

async fn latest_book_ticker(State(state): State<AppState>, Path((provider, symbol)): Path<(String, String)>) -> Json<Option<BookTickerSnapshot>> {
    Json(state.hub.book_tickers().latest(&provider, &symbol))
}

#[derive(Debug, Deserialize)]
struct AnomalyQuery {
    lookback: Option<usize>,
    threshold: Option<f64>,
}

async fn book_ticker_anomalies(
    State(state): State<AppState>,
    Path((provider, symbol)): Path<(String, String)>,
    Query(query): Query<AnomalyQuery>,
) -> Json<BookTickersResponse> {
    let lookback = query.lookback.unwrap_or(1000);
    let threshold = query.threshold.unwrap_or(3.0);
    Json(BookTickersResponse {
        snapshots: state.hub.book_tickers().detect_spread_anomalies(&provider, &symbol, lookback, threshold),
    })
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    lookback: Option<usize>,
}

#[derive(Debug, Serialize)]
struct BookTickerStatsResponse {
    average_spread: Option<f64>,
    average_spread_bps: Option<f64>,
    average_imbalance: Option<f64>,
}

async fn book_ticker_stats(
    State(state): State<AppState>,
    Path((provider, symbol)): Path<(String, String)>,
    Query(query): Query<StatsQuery>,
) -> Json<BookTickerStatsResponse> {
    let store = state.hub.book_tickers();
    Json(BookTickerStatsResponse {
        average_spread: store.average_spread(&provider, &symbol, query.lookback),
        average_spread_bps: store.average_spread_bps(&provider, &symbol, query.lookback),
        average_imbalance: store.average_imbalance(&provider, &symbol, query.lookback),
    })
}

async fn clear(State(state): State<AppState>, Path((provider, symbol)): Path<(String, String)>) -> Json<StatusResponse> {
    state.hub.trades().clear(&provider, &symbol);
    state.hub.order_books().clear(&provider, &symbol);
    state.hub.book_tickers().clear(&provider, &symbol);
    Json(StatusResponse { ok: true })
}

fn parse_iso8601_ms(raw: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| MarketDataError::InvalidArgument(format!("invalid ISO-8601 timestamp '{raw}'")))
}
