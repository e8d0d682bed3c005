//! Deterministic mock provider: a scenario-driven stochastic price/volume
//! generator, historical-candle synthesizer, and live ticker/kline emitter.
//! This is the substantive simulation state machine the rest of the
//! pipeline exercises in place of a real exchange.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::MarketDataError;
use crate::provider::{DataEvent, DataHandler, Provider, Result, StreamType, SubscriptionKey};
use crate::time::Interval;
use crate::types::{BookTickerSnapshot, Candle, OrderBookSnapshot, PriceQty, Trade};

/// Historical-synthesis cache bound, independent of the downstream
/// `CandleStore`'s own `candle_max` cap.
const HISTORICAL_CACHE_BOUND: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scenario {
    BullRun,
    BearMarket,
    Volatile,
    Sideways,
    PumpAndDump,
    Normal,
}

impl Scenario {
    pub fn parse(label: &str) -> Self {
        match label.to_ascii_uppercase().as_str() {
            "BULL_RUN" => Scenario::BullRun,
            "BEAR_MARKET" => Scenario::BearMarket,
            "VOLATILE" => Scenario::Volatile,
            "SIDEWAYS" => Scenario::Sideways,
            "PUMP_AND_DUMP" => Scenario::PumpAndDump,
            _ => Scenario::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PumpDumpPhase {
    Dormant,
    Pumping(u32),
    Dumping(u32),
}

struct MarketState {
    current_price: f64,
    base_price: f64,
    trend: f64,
    volatility: f64,
    momentum: f64,
    scenario: Scenario,
    pump_dump: PumpDumpPhase,
    ticks_since_trend_change: u64,
    rng: StdRng,
}

impl MarketState {
    fn new(symbol: &str, base_price: f64, default_volatility: f64, default_scenario: Scenario) -> Self {
        let seed = symbol.bytes().fold(0x9E3779B97F4A7C15u64, |acc, b| {
            acc.wrapping_mul(0x100000001B3).wrapping_add(b as u64)
        });
        Self {
            current_price: base_price,
            base_price,
            trend: 0.0,
            volatility: default_volatility,
            momentum: 0.0,
            scenario: default_scenario,
            pump_dump: PumpDumpPhase::Dormant,
            ticks_since_trend_change: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One scenario-tick: update trend/volatility/momentum per the scenario
    /// policy table, then apply the shared price-change formula.
    /// Returns `(new_price, tick_volume)`.
    fn tick(&mut self) -> (f64, f64) {
        self.ticks_since_trend_change += 1;
        self.apply_scenario_policy();

        let z: f64 = StandardNormal.sample(&mut self.rng);
        let mean_reversion = if self.base_price > 0.0
            && ((self.current_price - self.base_price).abs() / self.base_price) > 0.10
        {
            -0.01 * (self.current_price - self.base_price)
        } else {
            0.0
        };

        let delta = self.current_price * self.trend
            + self.current_price * self.momentum
            + self.current_price * self.volatility * z
            + mean_reversion;

        self.current_price = (self.current_price + delta).max(0.01);

        if self.momentum.abs() > 0.01 {
            self.momentum *= 0.5;
        }

        let volume = 0.01 + self.rng.gen::<f64>() * 2.0;
        (self.current_price, volume)
    }

    fn apply_scenario_policy(&mut self) {
        match self.scenario {
            Scenario::BullRun => {
                self.trend = 0.0008;
                if self.rng.gen::<f64>() < 0.05 {
                    self.trend = -0.0005;
                }
                self.volatility = 0.0015;
                self.momentum += 2e-5;
            }
            Scenario::BearMarket => {
                self.trend = -0.0008;
                if self.rng.gen::<f64>() < 0.05 {
                    self.trend = 0.0005;
                }
                self.volatility = 0.0015;
                self.momentum -= 2e-5;
            }
            Scenario::Volatile => {
                if self.ticks_since_trend_change % 20 == 0 {
                    let dist = Normal::new(0.0, 0.001).expect("valid normal params");
                    self.trend = dist.sample(&mut self.rng);
                }
                self.volatility = 0.003;
            }
            Scenario::Sideways => {
                if self.ticks_since_trend_change % 50 == 0 {
                    let magnitude = 0.0003;
                    self.trend = if self.trend > 0.0 { -magnitude } else { magnitude };
                }
                self.volatility = 0.0005;
            }
            Scenario::PumpAndDump => self.apply_pump_dump_policy(),
            Scenario::Normal => {
                if self.ticks_since_trend_change % 100 == 0 {
                    let dist = Normal::new(0.0, 3e-4).expect("valid normal params");
                    self.trend = dist.sample(&mut self.rng);
                }
            }
        }
    }

    fn apply_pump_dump_policy(&mut self) {
        self.pump_dump = match self.pump_dump {
            PumpDumpPhase::Dormant => {
                if self.rng.gen::<f64>() < 0.005 {
                    PumpDumpPhase::Pumping(100)
                } else {
                    self.trend = 0.0;
                    PumpDumpPhase::Dormant
                }
            }
            PumpDumpPhase::Pumping(remaining) => {
                self.trend = 0.01;
                self.volatility = 0.003;
                match remaining.saturating_sub(1) {
                    0 => PumpDumpPhase::Dumping(80),
                    n => PumpDumpPhase::Pumping(n),
                }
            }
            PumpDumpPhase::Dumping(remaining) => {
                self.trend = -0.015;
                self.volatility = 0.005;
                match remaining.saturating_sub(1) {
                    0 => PumpDumpPhase::Dormant,
                    n => PumpDumpPhase::Dumping(n),
                }
            }
        };
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp(8)
}

fn now_seconds() -> i64 {
    Utc::now().timestamp()
}

struct Inner {
    name: String,
    symbols: Vec<String>,
    ticker_ms: u64,
    default_volatility: f64,
    default_scenario: Scenario,

    connected: AtomicBool,
    handler: RwLock<Option<DataHandler>>,
    states: Mutex<HashMap<String, MarketState>>,
    open_candles: Mutex<HashMap<(String, Interval), Candle>>,
    historical_cache: Mutex<HashMap<(String, Interval), VecDeque<Candle>>>,
    subscriptions: Mutex<HashSet<SubscriptionKey>>,

    ticker_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    kline_tasks: Mutex<HashMap<(String, Interval), JoinHandle<()>>>,
}

impl Inner {
    fn emit(&self, event: DataEvent) {
        if let Some(handler) = self.handler.read().as_ref() {
            handler(event);
        }
    }

    fn state_for(&self, symbol: &str) -> parking_lot::MappedMutexGuard<'_, MarketState> {
        parking_lot::MutexGuard::map(self.states.lock(), |states| {
            states
                .entry(symbol.to_string())
                .or_insert_with(|| MarketState::new(symbol, 100.0, self.default_volatility, self.default_scenario))
        })
    }
}

/// Scenario-driven mock market-data provider.
pub struct MockProvider(Arc<Inner>);

impl MockProvider {
    pub fn new(name: impl Into<String>, symbols: Vec<String>, ticker_ms: u64, default_volatility: f64, default_scenario: Scenario) -> Self {
        Self(Arc::new(Inner {
            name: name.into(),
            symbols,
            ticker_ms,
            default_volatility,
            default_scenario,
            connected: AtomicBool::new(false),
            handler: RwLock::new(None),
            states: Mutex::new(HashMap::new()),
            open_candles: Mutex::new(HashMap::new()),
            historical_cache: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            ticker_tasks: Mutex::new(HashMap::new()),
            kline_tasks: Mutex::new(HashMap::new()),
        }))
    }

    // ---- Control surface ----

    pub fn set_market_scenario(&self, symbol: &str, scenario: Scenario) {
        self.0.state_for(symbol).scenario = scenario;
    }

    pub fn set_symbol_volatility(&self, symbol: &str, volatility: f64) {
        self.0.state_for(symbol).volatility = volatility;
    }

    pub fn set_symbol_trend(&self, symbol: &str, trend: f64) {
        self.0.state_for(symbol).trend = trend;
    }

    pub fn reset_symbol_price(&self, symbol: &str, price: f64) {
        let mut state = self.0.state_for(symbol);
        state.current_price = price;
        state.base_price = price;
        state.momentum = 0.0;
    }

    pub fn trigger_pump(&self, symbol: &str) {
        self.0.state_for(symbol).pump_dump = PumpDumpPhase::Pumping(100);
    }

    pub fn trigger_dump(&self, symbol: &str) {
        self.0.state_for(symbol).pump_dump = PumpDumpPhase::Dumping(80);
    }

    fn ensure_ticker_task(&self, symbol: &str) {
        let mut tasks = self.0.ticker_tasks.lock();
        if tasks.contains_key(symbol) {
            return;
        }
        let inner = self.0.clone();
        let symbol = symbol.to_string();
        let handle = tokio::spawn(run_ticker_task(inner, symbol.clone()));
        tasks.insert(symbol, handle);
    }

    fn ensure_kline_task(&self, symbol: &str, interval: Interval) {
        let key = (symbol.to_string(), interval);
        let mut tasks = self.0.kline_tasks.lock();
        if tasks.contains_key(&key) {
            return;
        }
        let inner = self.0.clone();
        let handle = tokio::spawn(run_kline_task(inner, key.0.clone(), interval));
        tasks.insert(key, handle);
    }

    fn synthesize_history(&self, symbol: &str, interval: Interval, count: usize) -> VecDeque<Candle> {
        let count = count.max(1);
        let mut state = self.0.state_for(symbol);
        let end_price = state.current_price;

        let mut closes = VecDeque::with_capacity(count);
        let mut price = end_price;
        for _ in 0..count {
            closes.push_front(price);
            let r: f64 = Normal::new(0.0, state.volatility.max(1e-6))
                .expect("valid normal params")
                .sample(&mut state.rng);
            price = (price / (1.0 + r)).max(0.01);
        }

        let last_open_time = interval.bucket_start(now_seconds());
        let mut candles = VecDeque::with_capacity(count);
        for (i, close) in closes.iter().enumerate() {
            let open_time = last_open_time - ((count - 1 - i) as i64) * interval.seconds();
            let open_price = if i == 0 { *close } else { closes[i - 1] };
            let high = open_price.max(*close) * 1.0005;
            let low = open_price.min(*close) * 0.9995;
            let volume = 10.0 + state.rng.gen::<f64>() * 50.0;
            candles.push_back(Candle {
                symbol: symbol.to_string(),
                provider: self.0.name.clone(),
                interval,
                open_time,
                close_time: open_time + interval.seconds(),
                open: to_decimal(open_price),
                high: to_decimal(high),
                low: to_decimal(low),
                close: to_decimal(*close),
                volume: to_decimal(volume),
                quote_asset_volume: to_decimal(volume * *close),
                number_of_trades: (volume as u64).max(1),
                closed: true,
            });
        }

        // Continuity: the live stream must continue from here.
        state.current_price = end_price;
        state.base_price = end_price;

        if candles.len() > HISTORICAL_CACHE_BOUND {
            let overflow = candles.len() - HISTORICAL_CACHE_BOUND;
            candles.drain(0..overflow);
        }
        candles
    }
}

async fn run_ticker_task(inner: Arc<Inner>, symbol: String) {
    let mut interval = tokio::time::interval(Duration::from_millis(inner.ticker_ms.max(1)));
    loop {
        interval.tick().await;
        if !inner.connected.load(Ordering::SeqCst) {
            return;
        }

        let (price, volume) = inner.state_for_task(&symbol).tick();
        let price_dec = to_decimal(price);
        let volume_dec = to_decimal(volume);
        let ts = Utc::now().timestamp_millis();

        inner.emit(DataEvent::Ticker {
            provider: inner.name.clone(),
            symbol: symbol.clone(),
            price: price_dec,
            timestamp: ts,
        });

        let subs: Vec<SubscriptionKey> = inner
            .subscriptions
            .lock()
            .iter()
            .filter(|k| k.symbol == symbol)
            .cloned()
            .collect();

        for sub in &subs {
            match sub.stream_type {
                StreamType::Kline => {
                    if let Some(interval) = sub.interval {
                        fold_tick_into_open_candle(&inner, &symbol, interval, price_dec, volume_dec);
                    }
                }
                StreamType::Trades | StreamType::AggregateTrades => {
                    let aggressive_buy = inner.state_for_task(&symbol).gen_bool(0.5);
                    let trade = Trade {
                        symbol: symbol.clone(),
                        provider: inner.name.clone(),
                        timestamp: ts,
                        price: price_dec,
                        quantity: volume_dec,
                        aggressive_buy,
                        trade_id: None,
                    };
                    let event = if sub.stream_type == StreamType::Trades {
                        DataEvent::Trade(trade)
                    } else {
                        DataEvent::AggregateTrade(trade)
                    };
                    inner.emit(event);
                }
                StreamType::BookTicker => {
                    inner.emit(DataEvent::BookTicker(synth_book_ticker(&inner.name, &symbol, price, ts)));
                }
                StreamType::OrderBook => {
                    let depth = sub.depth.unwrap_or(20);
                    inner.emit(DataEvent::OrderBook(synth_order_book(&inner.name, &symbol, price, depth, ts)));
                }
                StreamType::Ticker => {}
            }
        }
    }
}

fn fold_tick_into_open_candle(inner: &Inner, symbol: &str, interval: Interval, price: Decimal, volume: Decimal) {
    let bucket = interval.bucket_start(now_seconds());
    let mut open_candles = inner.open_candles.lock();
    let key = (symbol.to_string(), interval);
    let candle = open_candles.entry(key).or_insert_with(|| Candle {
        symbol: symbol.to_string(),
        provider: inner.name.clone(),
        interval,
        open_time: bucket,
        close_time: bucket + interval.seconds(),
        open: price,
        high: price,
        low: price,
        close: price,
        volume: Decimal::ZERO,
        quote_asset_volume: Decimal::ZERO,
        number_of_trades: 0,
        closed: false,
    });

    // If the bucket has already rolled over, leave the rollover to the kline
    // scheduler rather than racing it here.
    if candle.open_time == bucket {
        candle.apply_tick(price, volume);
        let emitted = candle.clone();
        drop(open_candles);
        inner.emit(DataEvent::Kline(emitted));
    }
}

fn synth_book_ticker(provider: &str, symbol: &str, price: f64, ts: i64) -> BookTickerSnapshot {
    let half_spread = (price * 0.0005).max(0.0001);
    BookTickerSnapshot {
        symbol: symbol.to_string(),
        provider: provider.to_string(),
        timestamp: ts,
        best_bid: PriceQty {
            price: to_decimal(price - half_spread),
            quantity: to_decimal(1.0 + (price % 3.0).abs()),
        },
        best_ask: PriceQty {
            price: to_decimal(price + half_spread),
            quantity: to_decimal(1.0 + (price % 5.0).abs()),
        },
    }
}

fn synth_order_book(provider: &str, symbol: &str, price: f64, depth: u32, ts: i64) -> OrderBookSnapshot {
    let tick = (price * 0.0005).max(0.0001);
    let mut bids = Vec::with_capacity(depth as usize);
    let mut asks = Vec::with_capacity(depth as usize);
    for i in 1..=depth as i64 {
        bids.push(PriceQty {
            price: to_decimal(price - tick * i as f64),
            quantity: to_decimal(1.0 + i as f64 * 0.1),
        });
        asks.push(PriceQty {
            price: to_decimal(price + tick * i as f64),
            quantity: to_decimal(1.0 + i as f64 * 0.1),
        });
    }
    OrderBookSnapshot {
        symbol: symbol.to_string(),
        provider: provider.to_string(),
        timestamp: ts,
        bids,
        asks,
    }
}

async fn run_kline_task(inner: Arc<Inner>, symbol: String, interval: Interval) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.seconds().max(1) as u64));
    loop {
        ticker.tick().await;
        if !inner.connected.load(Ordering::SeqCst) {
            return;
        }

        let bucket = interval.bucket_start(now_seconds());
        let price = to_decimal(inner.state_for_task(&symbol).current_price());
        let key = (symbol.clone(), interval);

        let mut open_candles = inner.open_candles.lock();
        let existing = open_candles.get(&key).cloned();
        match existing {
            Some(candle) if candle.open_time < bucket => {
                let mut frozen = candle;
                frozen.closed = true;
                frozen.close_time = bucket;

                let new_candle = Candle {
                    symbol: symbol.clone(),
                    provider: inner.name.clone(),
                    interval,
                    open_time: bucket,
                    close_time: bucket + interval.seconds(),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: Decimal::ZERO,
                    quote_asset_volume: Decimal::ZERO,
                    number_of_trades: 0,
                    closed: false,
                };
                open_candles.insert(key.clone(), new_candle.clone());
                drop(open_candles);

                inner.emit(DataEvent::Kline(frozen.clone()));
                inner.emit(DataEvent::Kline(new_candle));
                append_if_after_last(&inner, &key, frozen);
            }
            Some(candle) => {
                drop(open_candles);
                inner.emit(DataEvent::Kline(candle));
            }
            None => {
                let new_candle = Candle {
                    symbol: symbol.clone(),
                    provider: inner.name.clone(),
                    interval,
                    open_time: bucket,
                    close_time: bucket + interval.seconds(),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: Decimal::ZERO,
                    quote_asset_volume: Decimal::ZERO,
                    number_of_trades: 0,
                    closed: false,
                };
                open_candles.insert(key, new_candle.clone());
                drop(open_candles);
                inner.emit(DataEvent::Kline(new_candle));
            }
        }
    }
}

fn append_if_after_last(inner: &Inner, key: &(String, Interval), candle: Candle) {
    let mut cache = inner.historical_cache.lock();
    if let Some(deque) = cache.get_mut(key) {
        let should_append = deque.back().map(|c| candle.open_time > c.open_time).unwrap_or(true);
        if should_append {
            deque.push_back(candle);
            if deque.len() > HISTORICAL_CACHE_BOUND {
                deque.pop_front();
            }
        }
    }
}

// `state_for` above returns a `MappedMutexGuard` tied to `&self`'s lifetime,
// which doesn't work from a `tokio::spawn`ed task holding only `Arc<Inner>`.
// Tasks use this non-generic helper instead, which re-locks per call.
impl Inner {
    fn state_for_task(&self, symbol: &str) -> MarketStateSnapshot<'_> {
        MarketStateSnapshot {
            guard: parking_lot::MutexGuard::map(self.states.lock(), |states| {
                states.entry(symbol.to_string()).or_insert_with(|| {
                    MarketState::new(symbol, 100.0, self.default_volatility, self.default_scenario)
                })
            }),
        }
    }
}

struct MarketStateSnapshot<'a> {
    guard: parking_lot::MappedMutexGuard<'a, MarketState>,
}

impl MarketStateSnapshot<'_> {
    fn tick(&mut self) -> (f64, f64) {
        self.guard.tick()
    }

    fn gen_bool(&mut self, p: f64) -> bool {
        self.guard.rng.gen_bool(p)
    }

    fn current_price(&self) -> f64 {
        self.guard.current_price
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn provider_name(&self) -> &str {
        &self.0.name
    }

    fn supported_symbols(&self) -> Vec<String> {
        self.0.symbols.clone()
    }

    fn supported_intervals(&self) -> Vec<Interval> {
        Interval::ALL.to_vec()
    }

    async fn connect(&self) -> Result<()> {
        self.0.connected.store(true, Ordering::SeqCst);
        info!(provider = %self.0.name, "mock provider connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.0.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for (_, handle) in self.0.ticker_tasks.lock().drain() {
            handle.abort();
        }
        for (_, handle) in self.0.kline_tasks.lock().drain() {
            handle.abort();
        }
        self.0.subscriptions.lock().clear();
        info!(provider = %self.0.name, "mock provider disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbol: &str) -> Result<()> {
        if !self.0.connected.load(Ordering::SeqCst) {
            return Err(MarketDataError::NotConnected(self.0.name.clone()));
        }
        self.0.subscriptions.lock().insert(SubscriptionKey::ticker(symbol));
        self.ensure_ticker_task(symbol);
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<()> {
        self.0.subscriptions.lock().remove(&SubscriptionKey::ticker(symbol));
        Ok(())
    }

    async fn subscribe_kline(&self, symbol: &str, interval: Interval) -> Result<()> {
        if !self.0.connected.load(Ordering::SeqCst) {
            return Err(MarketDataError::NotConnected(self.0.name.clone()));
        }
        self.0.subscriptions.lock().insert(SubscriptionKey::kline(symbol, interval));
        self.ensure_ticker_task(symbol);
        self.ensure_kline_task(symbol, interval);
        Ok(())
    }

    async fn unsubscribe_kline(&self, symbol: &str, interval: Interval) -> Result<()> {
        self.0.subscriptions.lock().remove(&SubscriptionKey::kline(symbol, interval));
        if let Some(handle) = self.0.kline_tasks.lock().remove(&(symbol.to_string(), interval)) {
            handle.abort();
        }
        Ok(())
    }

    async fn subscribe_trades(&self, symbol: &str) -> Result<()> {
        if !self.0.connected.load(Ordering::SeqCst) {
            return Err(MarketDataError::NotConnected(self.0.name.clone()));
        }
        self.0.subscriptions.lock().insert(SubscriptionKey::trades(symbol));
        self.ensure_ticker_task(symbol);
        Ok(())
    }

    async fn unsubscribe_trades(&self, symbol: &str) -> Result<()> {
        self.0.subscriptions.lock().remove(&SubscriptionKey::trades(symbol));
        Ok(())
    }

    async fn subscribe_aggregate_trades(&self, symbol: &str) -> Result<()> {
        if !self.0.connected.load(Ordering::SeqCst) {
            return Err(MarketDataError::NotConnected(self.0.name.clone()));
        }
        self.0.subscriptions.lock().insert(SubscriptionKey::aggregate_trades(symbol));
        self.ensure_ticker_task(symbol);
        Ok(())
    }

    async fn unsubscribe_aggregate_trades(&self, symbol: &str) -> Result<()> {
        self.0.subscriptions.lock().remove(&SubscriptionKey::aggregate_trades(symbol));
        Ok(())
    }

    async fn subscribe_order_book(&self, symbol: &str, depth: u32) -> Result<()> {
        if !matches!(depth, 5 | 10 | 20) {
            return Err(MarketDataError::InvalidArgument(format!(
                "depth must be 5, 10 or 20, got {depth}"
            )));
        }
        if !self.0.connected.load(Ordering::SeqCst) {
            return Err(MarketDataError::NotConnected(self.0.name.clone()));
        }
        self.0.subscriptions.lock().insert(SubscriptionKey::order_book(symbol, depth));
        self.ensure_ticker_task(symbol);
        Ok(())
    }

    async fn unsubscribe_order_book(&self, symbol: &str) -> Result<()> {
        let key = self
            .0
            .subscriptions
            .lock()
            .iter()
            .find(|k| k.stream_type == StreamType::OrderBook && k.symbol == symbol)
            .cloned();
        if let Some(key) = key {
            self.0.subscriptions.lock().remove(&key);
        }
        Ok(())
    }

    async fn subscribe_book_ticker(&self, symbol: &str) -> Result<()> {
        if !self.0.connected.load(Ordering::SeqCst) {
            return Err(MarketDataError::NotConnected(self.0.name.clone()));
        }
        self.0.subscriptions.lock().insert(SubscriptionKey::book_ticker(symbol));
        self.ensure_ticker_task(symbol);
        Ok(())
    }

    async fn unsubscribe_book_ticker(&self, symbol: &str) -> Result<()> {
        self.0.subscriptions.lock().remove(&SubscriptionKey::book_ticker(symbol));
        Ok(())
    }

    fn set_data_handler(&self, handler: DataHandler) {
        let mut slot = self.0.handler.write();
        if slot.is_some() {
            warn!(provider = %self.0.name, "replacing existing data handler");
        }
        *slot = Some(handler);
    }

    async fn get_historical_klines(&self, symbol: &str, interval: Interval, limit: usize) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, HISTORICAL_CACHE_BOUND);
        let key = (symbol.to_string(), interval);

        let needs_synthesis = !self.0.historical_cache.lock().contains_key(&key);
        if needs_synthesis {
            let synthesized = self.synthesize_history(symbol, interval, limit.max(200));
            self.0.historical_cache.lock().insert(key.clone(), synthesized);
        }

        let cache = self.0.historical_cache.lock();
        let deque = cache.get(&key).cloned().unwrap_or_default();
        let start = deque.len().saturating_sub(limit);
        Ok(deque.into_iter().skip(start).collect())
    }

    async fn get_historical_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>> {
        let limit = limit.clamp(1, 5000);
        let mut state = self.0.state_for(symbol);
        let price = state.current_price;
        let now = Utc::now().timestamp_millis();
        let trades = (0..limit)
            .map(|i| {
                let jitter: f64 = StandardNormal.sample(&mut state.rng) * price * 0.0005;
                Trade {
                    symbol: symbol.to_string(),
                    provider: self.0.name.clone(),
                    timestamp: now - (limit - i) as i64 * 1000,
                    price: to_decimal(price + jitter),
                    quantity: to_decimal(0.01 + state.rng.gen::<f64>() * 2.0),
                    aggressive_buy: state.rng.gen_bool(0.5),
                    trade_id: Some((now as u64).wrapping_add(i as u64)),
                }
            })
            .collect();
        Ok(trades)
    }

    async fn get_historical_aggregate_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>> {
        self.get_historical_trades(symbol, limit).await
    }

    async fn get_historical_order_book_snapshot(&self, symbol: &str, limit: usize) -> Result<Vec<OrderBookSnapshot>> {
        let limit = limit.clamp(1, 100);
        let price = self.0.state_for(symbol).current_price;
        let now = Utc::now().timestamp_millis();
        let snapshots = (0..limit)
            .map(|i| synth_order_book(&self.0.name, symbol, price, 20, now - (limit - i) as i64 * 1000))
            .collect();
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_reversion_stays_bounded_over_many_ticks() {
        // Mean-reversion bound: |mean(price) - 100| < 20 over 10_000 ticks
        // from base_price = 100, for any scenario.
        for scenario in [
            Scenario::BullRun,
            Scenario::BearMarket,
            Scenario::Volatile,
            Scenario::Sideways,
            Scenario::PumpAndDump,
            Scenario::Normal,
        ] {
            let mut state = MarketState::new("BTCUSDT", 100.0, 0.001, scenario);
            let mut sum = 0.0;
            for _ in 0..10_000 {
                let (price, _) = state.tick();
                sum += price;
            }
            let mean = sum / 10_000.0;
            assert!(
                (mean - 100.0).abs() < 20.0,
                "scenario {:?} drifted too far: mean={}",
                scenario,
                mean
            );
        }
    }

    #[test]
    fn price_floor_is_respected() {
        let mut state = MarketState::new("X", 0.02, 0.5, Scenario::BearMarket);
        for _ in 0..1000 {
            let (price, _) = state.tick();
            assert!(price >= 0.01);
        }
    }

    #[test]
    fn scenario_label_parsing_defaults_to_normal() {
        assert_eq!(Scenario::parse("BULL_RUN"), Scenario::BullRun);
        assert_eq!(Scenario::parse("not-a-scenario"), Scenario::Normal);
    }
}
