//! External exchange provider: a real WebSocket client against a
//! Binance-shaped combined-stream endpoint, with normalization,
//! exponential-backoff reconnection, and a bounded handoff so a slow
//! downstream consumer cannot stall the wire.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::MarketDataError;
use crate::provider::{DataEvent, DataHandler, Provider, Result, SubscriptionKey};
use crate::time::Interval;
use crate::types::{BookTickerSnapshot, Candle, OrderBookSnapshot, PriceQty, Trade};

const HISTORICAL_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Bounded handoff capacity between the WS reader and the forwarder task.
const HANDOFF_CAPACITY: usize = 4096;

/// Exponential backoff with jitter, capped.
#[derive(Debug)]
struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl ReconnectBackoff {
    fn new() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.3,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64 | 1)
                .unwrap_or(0x9E3779B97F4A7C15),
        }
    }

    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    fn next_delay(&mut self) -> Duration {
        let base_ms = self.base.as_millis() as f64 * self.multiplier.powi(self.attempt as i32);
        let capped = base_ms.min(self.max.as_millis() as f64);
        let jitter_range = capped * self.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.base.as_millis() as f64);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum WsCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Shutdown,
}

/// A real exchange's WebSocket + REST market-data provider.
pub struct ExchangeProvider {
    name: String,
    ws_base_url: String,
    rest_base_url: String,
    symbols: Vec<String>,
    http: reqwest::Client,

    connected: AtomicBool,
    handler: Arc<RwLock<Option<DataHandler>>>,
    subscriptions: Mutex<HashSet<SubscriptionKey>>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<WsCommand>>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    forwarder_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ExchangeProvider {
    pub fn new(name: impl Into<String>, symbols: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ws_base_url: "wss://stream.binance.com:9443/stream".to_string(),
            rest_base_url: "https://api.binance.com".to_string(),
            symbols,
            http: reqwest::Client::builder()
                .timeout(HISTORICAL_FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            connected: AtomicBool::new(false),
            handler: Arc::new(RwLock::new(None)),
            subscriptions: Mutex::new(HashSet::new()),
            cmd_tx: Mutex::new(None),
            reader_task: Mutex::new(None),
            forwarder_task: Mutex::new(None),
        })
    }

    fn stream_param(key: &SubscriptionKey) -> String {
        let symbol = key.symbol.to_lowercase();
        match key.stream_type {
            crate::provider::StreamType::Ticker => format!("{symbol}@miniTicker"),
            crate::provider::StreamType::Kline => format!(
                "{symbol}@kline_{}",
                key.interval.map(|i| i.label()).unwrap_or("1m")
            ),
            crate::provider::StreamType::Trades => format!("{symbol}@trade"),
            crate::provider::StreamType::AggregateTrades => format!("{symbol}@aggTrade"),
            crate::provider::StreamType::OrderBook => {
                format!("{symbol}@depth{}", key.depth.unwrap_or(20))
            }
            crate::provider::StreamType::BookTicker => format!("{symbol}@bookTicker"),
        }
    }

    async fn add_subscription(&self, key: SubscriptionKey) -> Result<()> {
        if !self.is_connected() {
            return Err(MarketDataError::NotConnected(self.name.clone()));
        }
        if !self.symbols.iter().any(|s| s == &key.symbol) {
            return Err(MarketDataError::UnknownSymbol(key.symbol.clone()));
        }
        let param = Self::stream_param(&key);
        self.subscriptions.lock().insert(key);
        if let Some(tx) = self.cmd_tx.lock().as_ref() {
            let _ = tx.send(WsCommand::Subscribe(vec![param]));
        }
        Ok(())
    }

    async fn drop_subscription(&self, key: &SubscriptionKey) -> Result<()> {
        let param = Self::stream_param(key);
        self.subscriptions.lock().remove(key);
        if let Some(tx) = self.cmd_tx.lock().as_ref() {
            let _ = tx.send(WsCommand::Unsubscribe(vec![param]));
        }
        Ok(())
    }

    async fn historical_get(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.rest_base_url, path);
        let response = timeout(HISTORICAL_FETCH_TIMEOUT, self.http.get(&url).send())
            .await
            .map_err(|_| MarketDataError::TransportFailure(format!("timeout: {url}")))?
            .map_err(|e| MarketDataError::TransportFailure(e.to_string()))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| MarketDataError::TransportFailure(e.to_string()))
    }
}

fn normalize_kline_frame(provider: &str, k: &Value) -> Option<Candle> {
    let symbol = k.get("s")?.as_str()?.to_string();
    let open_time = k.get("t")?.as_i64()? / 1000;
    let close_time = k.get("T")?.as_i64()? / 1000;
    let interval = Interval::parse(k.get("i")?.as_str()?).ok()?;
    Some(Candle {
        symbol,
        provider: provider.to_string(),
        interval,
        open_time,
        close_time,
        open: k.get("o")?.as_str()?.parse().ok()?,
        high: k.get("h")?.as_str()?.parse().ok()?,
        low: k.get("l")?.as_str()?.parse().ok()?,
        close: k.get("c")?.as_str()?.parse().ok()?,
        volume: k.get("v")?.as_str()?.parse().ok()?,
        quote_asset_volume: k.get("q")?.as_str()?.parse().ok()?,
        number_of_trades: k.get("n")?.as_u64()?,
        closed: k.get("x")?.as_bool()?,
    })
}

fn normalize_trade_frame(provider: &str, v: &Value, is_agg: bool) -> Option<Trade> {
    let symbol = v.get("s")?.as_str()?.to_string();
    let timestamp = v.get("T")?.as_i64()?;
    let price: Decimal = v.get("p")?.as_str()?.parse().ok()?;
    let quantity: Decimal = v.get("q")?.as_str()?.parse().ok()?;
    let buyer_is_maker = v.get("m")?.as_bool()?;
    let trade_id = if is_agg {
        v.get("a").and_then(|x| x.as_u64())
    } else {
        v.get("t").and_then(|x| x.as_u64())
    };
    Some(Trade {
        symbol,
        provider: provider.to_string(),
        timestamp,
        price,
        quantity,
        aggressive_buy: !buyer_is_maker,
        trade_id,
    })
}

fn normalize_book_ticker_frame(provider: &str, v: &Value) -> Option<BookTickerSnapshot> {
    let symbol = v.get("s")?.as_str()?.to_string();
    let timestamp = v
        .get("E")
        .and_then(|x| x.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    Some(BookTickerSnapshot {
        symbol,
        provider: provider.to_string(),
        timestamp,
        best_bid: PriceQty {
            price: v.get("b")?.as_str()?.parse().ok()?,
            quantity: v.get("B")?.as_str()?.parse().ok()?,
        },
        best_ask: PriceQty {
            price: v.get("a")?.as_str()?.parse().ok()?,
            quantity: v.get("A")?.as_str()?.parse().ok()?,
        },
    })
}

fn parse_levels(raw: &Value) -> Vec<PriceQty> {
    raw.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|pair| {
                    let pair = pair.as_array()?;
                    let price = pair.get(0)?.as_str()?.parse().ok()?;
                    let quantity = pair.get(1)?.as_str()?.parse().ok()?;
                    Some(PriceQty { price, quantity })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_depth_frame(provider: &str, symbol: &str, v: &Value) -> Option<OrderBookSnapshot> {
    Some(OrderBookSnapshot {
        symbol: symbol.to_string(),
        provider: provider.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        bids: parse_levels(v.get("bids")?),
        asks: parse_levels(v.get("asks")?),
    })
}

#[async_trait]
impl Provider for ExchangeProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn supported_symbols(&self) -> Vec<String> {
        self.symbols.clone()
    }

    fn supported_intervals(&self) -> Vec<Interval> {
        Interval::ALL.to_vec()
    }

    async fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(()); // idempotent
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        *self.cmd_tx.lock() = Some(cmd_tx);

        let (event_tx, mut event_rx) = mpsc::channel::<DataEvent>(HANDOFF_CAPACITY);

        let handler_src = self.handler.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let Some(handler) = handler_src.read().as_ref() {
                    handler(event);
                }
            }
        });
        *self.forwarder_task.lock() = Some(forwarder);

        let ws_base_url = self.ws_base_url.clone();
        let provider_name = self.name.clone();
        let reader = tokio::spawn(run_connection_loop(
            ws_base_url,
            provider_name,
            cmd_rx,
            event_tx,
        ));
        *self.reader_task.lock() = Some(reader);

        info!(provider = %self.name, "exchange provider connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(()); // idempotent
        }
        if let Some(tx) = self.cmd_tx.lock().take() {
            let _ = tx.send(WsCommand::Shutdown);
        }
        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.forwarder_task.lock().take() {
            handle.abort();
        }
        self.subscriptions.lock().clear();
        info!(provider = %self.name, "exchange provider disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbol: &str) -> Result<()> {
        self.add_subscription(SubscriptionKey::ticker(symbol)).await
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<()> {
        self.drop_subscription(&SubscriptionKey::ticker(symbol)).await
    }

    async fn subscribe_kline(&self, symbol: &str, interval: Interval) -> Result<()> {
        self.add_subscription(SubscriptionKey::kline(symbol, interval)).await
    }

    async fn unsubscribe_kline(&self, symbol: &str, interval: Interval) -> Result<()> {
        self.drop_subscription(&SubscriptionKey::kline(symbol, interval)).await
    }

    async fn subscribe_trades(&self, symbol: &str) -> Result<()> {
        self.add_subscription(SubscriptionKey::trades(symbol)).await
    }

    async fn unsubscribe_trades(&self, symbol: &str) -> Result<()> {
        self.drop_subscription(&SubscriptionKey::trades(symbol)).await
    }

    async fn subscribe_aggregate_trades(&self, symbol: &str) -> Result<()> {
        self.add_subscription(SubscriptionKey::aggregate_trades(symbol)).await
    }

    async fn unsubscribe_aggregate_trades(&self, symbol: &str) -> Result<()> {
        self.drop_subscription(&SubscriptionKey::aggregate_trades(symbol)).await
    }

    async fn subscribe_order_book(&self, symbol: &str, depth: u32) -> Result<()> {
        if !matches!(depth, 5 | 10 | 20) {
            return Err(MarketDataError::InvalidArgument(format!(
                "depth must be 5, 10 or 20, got {depth}"
            )));
        }
        self.add_subscription(SubscriptionKey::order_book(symbol, depth)).await
    }

    async fn unsubscribe_order_book(&self, symbol: &str) -> Result<()> {
        let key = self
            .subscriptions
            .lock()
            .iter()
            .find(|k| {
                k.stream_type == crate::provider::StreamType::OrderBook && k.symbol == symbol
            })
            .cloned();
        if let Some(key) = key {
            self.drop_subscription(&key).await
        } else {
            Ok(())
        }
    }

    async fn subscribe_book_ticker(&self, symbol: &str) -> Result<()> {
        self.add_subscription(SubscriptionKey::book_ticker(symbol)).await
    }

    async fn unsubscribe_book_ticker(&self, symbol: &str) -> Result<()> {
        self.drop_subscription(&SubscriptionKey::book_ticker(symbol)).await
    }

    fn set_data_handler(&self, handler: DataHandler) {
        let mut slot = self.handler.write();
        if slot.is_some() {
            warn!(provider = %self.name, "replacing existing data handler");
        }
        *slot = Some(handler);
    }

    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, 1000);
        let path = format!(
            "/api/v3/klines?symbol={symbol}&interval={}&limit={limit}",
            interval.label()
        );
        let body = self.historical_get(&path).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        let candles = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                Some(Candle {
                    symbol: symbol.to_string(),
                    provider: self.name.clone(),
                    interval,
                    open_time: row.get(0)?.as_i64()? / 1000,
                    close_time: row.get(6)?.as_i64()? / 1000,
                    open: row.get(1)?.as_str()?.parse().ok()?,
                    high: row.get(2)?.as_str()?.parse().ok()?,
                    low: row.get(3)?.as_str()?.parse().ok()?,
                    close: row.get(4)?.as_str()?.parse().ok()?,
                    volume: row.get(5)?.as_str()?.parse().ok()?,
                    quote_asset_volume: row.get(7)?.as_str()?.parse().ok()?,
                    number_of_trades: row.get(8)?.as_u64()?,
                    closed: true,
                })
            })
            .collect();
        Ok(candles)
    }

    async fn get_historical_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>> {
        let limit = limit.clamp(1, 1000);
        let path = format!("/api/v3/trades?symbol={symbol}&limit={limit}");
        let body = self.historical_get(&path).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Trade {
                    symbol: symbol.to_string(),
                    provider: self.name.clone(),
                    timestamp: row.get("time")?.as_i64()?,
                    price: row.get("price")?.as_str()?.parse().ok()?,
                    quantity: row.get("qty")?.as_str()?.parse().ok()?,
                    aggressive_buy: !row.get("isBuyerMaker")?.as_bool()?,
                    trade_id: row.get("id").and_then(|x| x.as_u64()),
                })
            })
            .collect())
    }

    async fn get_historical_aggregate_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Trade>> {
        let limit = limit.clamp(1, 1000);
        let path = format!("/api/v3/aggTrades?symbol={symbol}&limit={limit}");
        let body = self.historical_get(&path).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Trade {
                    symbol: symbol.to_string(),
                    provider: self.name.clone(),
                    timestamp: row.get("T")?.as_i64()?,
                    price: row.get("p")?.as_str()?.parse().ok()?,
                    quantity: row.get("q")?.as_str()?.parse().ok()?,
                    aggressive_buy: !row.get("m")?.as_bool()?,
                    trade_id: row.get("a").and_then(|x| x.as_u64()),
                })
            })
            .collect())
    }

    async fn get_historical_order_book_snapshot(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<OrderBookSnapshot>> {
        let limit = limit.clamp(1, 1000);
        let path = format!("/api/v3/depth?symbol={symbol}&limit={limit}");
        let body = self.historical_get(&path).await?;
        match normalize_depth_frame(&self.name, symbol, &body) {
            Some(snapshot) => Ok(vec![snapshot]),
            None => Ok(vec![]),
        }
    }
}

async fn run_connection_loop(
    ws_base_url: String,
    provider_name: String,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    event_tx: mpsc::Sender<DataEvent>,
) {
    let mut backoff = ReconnectBackoff::new();
    let mut active_streams: HashSet<String> = HashSet::new();

    'reconnect: loop {
        let url = format!("{ws_base_url}?streams={}", active_streams.iter().cloned().collect::<Vec<_>>().join("/"));
        let (ws_stream, _) = match connect_async(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(provider = %provider_name, error = %e, "exchange ws connect failed, will retry");
                let delay = backoff.next_delay();
                tokio::time::sleep(delay).await;
                continue 'reconnect;
            }
        };
        backoff.reset();
        let (mut write, mut read) = ws_stream.split();
        debug!(provider = %provider_name, "exchange ws connected");

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(WsCommand::Subscribe(streams)) => {
                            for s in &streams { active_streams.insert(s.clone()); }
                            let frame = serde_json::json!({"method": "SUBSCRIBE", "params": streams, "id": 1});
                            if write.send(Message::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Some(WsCommand::Unsubscribe(streams)) => {
                            for s in &streams { active_streams.remove(s); }
                            let frame = serde_json::json!({"method": "UNSUBSCRIBE", "params": streams, "id": 1});
                            if write.send(Message::Text(frame.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Some(WsCommand::Shutdown) | None => {
                            let _ = write.close().await;
                            return;
                        }
                    }
                }
                maybe_msg = read.next() => {
                    match maybe_msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_frame(&provider_name, &text, &event_tx);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(provider = %provider_name, "exchange ws closed, reconnecting");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(provider = %provider_name, error = %e, "exchange ws read error, reconnecting");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        let delay = backoff.next_delay();
        tokio::time::sleep(delay).await;
    }
}

fn handle_frame(provider_name: &str, text: &str, event_tx: &mpsc::Sender<DataEvent>) {
    let Ok(envelope) = serde_json::from_str::<Value>(text) else {
        return;
    };
    // Combined-stream frames wrap the payload under "data"; raw single-stream
    // connections would not, so fall back to the envelope itself.
    let payload = envelope.get("data").unwrap_or(&envelope);
    let event_type = payload.get("e").and_then(|e| e.as_str());

    let event = match event_type {
        Some("kline") => payload
            .get("k")
            .and_then(|k| normalize_kline_frame(provider_name, k))
            .map(DataEvent::Kline),
        Some("trade") => normalize_trade_frame(provider_name, payload, false).map(DataEvent::Trade),
        Some("aggTrade") => {
            normalize_trade_frame(provider_name, payload, true).map(DataEvent::AggregateTrade)
        }
        Some("24hrMiniTicker") | Some("24hrTicker") => payload
            .get("c")
            .and_then(|c| c.as_str())
            .and_then(|c| c.parse::<Decimal>().ok())
            .and_then(|price| {
                Some(DataEvent::Ticker {
                    provider: provider_name.to_string(),
                    symbol: payload.get("s")?.as_str()?.to_string(),
                    price,
                    timestamp: payload
                        .get("E")
                        .and_then(|e| e.as_i64())
                        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
                })
            }),
        _ if payload.get("b").is_some() && payload.get("a").is_some() && payload.get("u").is_some() => {
            normalize_book_ticker_frame(provider_name, payload).map(DataEvent::BookTicker)
        }
        _ if payload.get("bids").is_some() && payload.get("asks").is_some() => payload
            .get("s")
            .and_then(|s| s.as_str())
            .and_then(|symbol| normalize_depth_frame(provider_name, symbol, payload))
            .map(DataEvent::OrderBook),
        _ => None,
    };

    if let Some(event) = event {
        // Non-blocking: a full handoff channel means a slow consumer, and the
        // wire must not stall for it. Drop and count instead.
        if event_tx.try_send(event).is_err() {
            debug!(provider = %provider_name, "handoff channel full, dropping event");
        }
    }
}
