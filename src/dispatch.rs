//! Dispatch hub: the provider registry, subscription lifecycle tracker, and
//! fan-out point every registered provider's single `DataHandler` sink feeds
//! into.
//!
//! Each provider still has one sink (`Provider::set_data_handler`), but that
//! sink is this hub's own `tokio::sync::broadcast::Sender<DataEvent>`, which
//! any number of WS connections can subscribe to independently. Store writes
//! and footprint aggregation happen once per event, centrally, before the
//! broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::MarketDataError;
use crate::footprint::FootprintEngine;
use crate::provider::{
    check_connected, check_symbol, DataEvent, Provider, ProviderLifecycle, StreamType, SubscriptionKey,
};
use crate::store::{BookTickerStore, CandleStore, OrderBookStore, TradeStore};
use crate::time::Interval;
use crate::types::stream_key;

pub type Result<T> = std::result::Result<T, MarketDataError>;

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// A snapshot of a registered provider's name and lifecycle state, for the
/// `/api/trading/providers` listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub connected: bool,
    pub subscriptions: usize,
}

/// Which streams `subscribe_all_orderflow` should include; all default to
/// `true` so an omitted query flag still subscribes to everything.
#[derive(Debug, Clone, Copy)]
pub struct OrderflowIncludes {
    pub trades: bool,
    pub aggregate_trades: bool,
    pub order_book: bool,
    pub book_ticker: bool,
}

impl Default for OrderflowIncludes {
    fn default() -> Self {
        Self {
            trades: true,
            aggregate_trades: true,
            order_book: true,
            book_ticker: true,
        }
    }
}

pub struct DispatchHub {
    config: Config,
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    lifecycles: Mutex<HashMap<String, ProviderLifecycle>>,
    events: broadcast::Sender<DataEvent>,

    candles: Arc<CandleStore>,
    trades: Arc<TradeStore>,
    order_books: Arc<OrderBookStore>,
    book_tickers: Arc<BookTickerStore>,
    footprint: Arc<FootprintEngine>,

    /// `(provider_symbol) -> set of intervals with an active kline
    /// subscription`, so incoming trades only feed the footprint engine for
    /// intervals someone actually asked for.
    kline_subscriptions: Arc<Mutex<HashMap<String, HashSet<Interval>>>>,
}

impl DispatchHub {
    pub fn new(config: Config) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            candles: Arc::new(CandleStore::new(config.candle_max)),
            trades: Arc::new(TradeStore::new(config.trade_max)),
            order_books: Arc::new(OrderBookStore::new(config.order_book_max, config.order_book_interval_s)),
            book_tickers: Arc::new(BookTickerStore::new(config.book_ticker_max, config.book_ticker_interval_ms)),
            footprint: FootprintEngine::new(config.clone()),
            providers: RwLock::new(HashMap::new()),
            lifecycles: Mutex::new(HashMap::new()),
            events,
            kline_subscriptions: Arc::new(Mutex::new(HashMap::new())),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn candles(&self) -> &Arc<CandleStore> {
        &self.candles
    }

    pub fn trades(&self) -> &Arc<TradeStore> {
        &self.trades
    }

    pub fn order_books(&self) -> &Arc<OrderBookStore> {
        &self.order_books
    }

    pub fn book_tickers(&self) -> &Arc<BookTickerStore> {
        &self.book_tickers
    }

    pub fn footprint(&self) -> &Arc<FootprintEngine> {
        &self.footprint
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DataEvent> {
        self.events.subscribe()
    }

    /// Registers a provider and wires its sink to this hub's central
    /// store/footprint routing, then fans the same event out on the shared
    /// broadcast channel.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let name = provider.provider_name().to_string();

        let candles = self.candles.clone();
        let trades = self.trades.clone();
        let order_books = self.order_books.clone();
        let book_tickers = self.book_tickers.clone();
        let footprint = self.footprint.clone();
        let kline_subscriptions = self.kline_subscriptions.clone();
        let events = self.events.clone();
        let handler_provider_name = name.clone();

        provider.set_data_handler(Arc::new(move |event: DataEvent| {
            route_event(
                &handler_provider_name,
                &event,
                &candles,
                &trades,
                &order_books,
                &book_tickers,
                &footprint,
                &kline_subscriptions,
            );
            // A full channel means there are no receivers yet, or every
            // receiver has fallen behind; neither is this hub's problem to
            // solve since each subscriber has its own broadcast lag handling.
            let _ = events.send(event);
        }));

        self.providers.write().insert(name.clone(), provider);
        self.lifecycles.lock().entry(name.clone()).or_default().register();
        info!(provider = %name, "provider registered");
    }

    pub fn list_providers(&self) -> Vec<ProviderStatus> {
        let providers = self.providers.read();
        let lifecycles = self.lifecycles.lock();
        providers
            .values()
            .map(|p| {
                let name = p.provider_name().to_string();
                let subscriptions = match lifecycles.get(&name) {
                    Some(ProviderLifecycle::Subscribed(set)) => set.len(),
                    _ => 0,
                };
                ProviderStatus {
                    name,
                    connected: p.is_connected(),
                    subscriptions,
                }
            })
            .collect()
    }

    fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MarketDataError::UnknownProvider(name.to_string()))
    }

    pub fn intervals(&self, name: &str) -> Result<Vec<Interval>> {
        Ok(self.get(name)?.supported_intervals())
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        let provider = self.get(name)?;
        provider.connect().await?;
        self.lifecycles.lock().entry(name.to_string()).or_default().mark_connected();
        Ok(())
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let provider = self.get(name)?;
        provider.disconnect().await?;
        self.lifecycles.lock().entry(name.to_string()).or_default().mark_disconnected();
        Ok(())
    }

    pub async fn subscribe_ticker(&self, name: &str, symbol: &str) -> Result<()> {
        let provider = self.get(name)?;
        check_connected(provider.as_ref())?;
        check_symbol(provider.as_ref(), symbol)?;
        provider.subscribe(symbol).await?;
        self.track_subscription(name, SubscriptionKey::ticker(symbol));
        Ok(())
    }

    pub async fn subscribe_kline(&self, name: &str, symbol: &str, interval: Interval) -> Result<()> {
        let provider = self.get(name)?;
        check_connected(provider.as_ref())?;
        check_symbol(provider.as_ref(), symbol)?;
        provider.subscribe_kline(symbol, interval).await?;
        self.track_subscription(name, SubscriptionKey::kline(symbol, interval));
        self.kline_subscriptions
            .lock()
            .entry(stream_key(name, symbol))
            .or_default()
            .insert(interval);
        Ok(())
    }

    pub async fn unsubscribe_kline(&self, name: &str, symbol: &str, interval: Interval) -> Result<()> {
        let provider = self.get(name)?;
        provider.unsubscribe_kline(symbol, interval).await?;
        self.untrack_subscription(name, &SubscriptionKey::kline(symbol, interval));
        if let Some(set) = self.kline_subscriptions.lock().get_mut(&stream_key(name, symbol)) {
            set.remove(&interval);
        }
        Ok(())
    }

    pub async fn subscribe_trades(&self, name: &str, symbol: &str) -> Result<()> {
        let provider = self.get(name)?;
        check_connected(provider.as_ref())?;
        check_symbol(provider.as_ref(), symbol)?;
        provider.subscribe_trades(symbol).await?;
        self.track_subscription(name, SubscriptionKey::trades(symbol));
        Ok(())
    }

    pub async fn unsubscribe_trades(&self, name: &str, symbol: &str) -> Result<()> {
        let provider = self.get(name)?;
        provider.unsubscribe_trades(symbol).await?;
        self.untrack_subscription(name, &SubscriptionKey::trades(symbol));
        Ok(())
    }

    pub async fn subscribe_aggregate_trades(&self, name: &str, symbol: &str) -> Result<()> {
        let provider = self.get(name)?;
        check_connected(provider.as_ref())?;
        check_symbol(provider.as_ref(), symbol)?;
        provider.subscribe_aggregate_trades(symbol).await?;
        self.track_subscription(name, SubscriptionKey::aggregate_trades(symbol));
        Ok(())
    }

    pub async fn unsubscribe_aggregate_trades(&self, name: &str, symbol: &str) -> Result<()> {
        let provider = self.get(name)?;
        provider.unsubscribe_aggregate_trades(symbol).await?;
        self.untrack_subscription(name, &SubscriptionKey::aggregate_trades(symbol));
        Ok(())
    }

    pub async fn subscribe_order_book(&self, name: &str, symbol: &str, depth: u32) -> Result<()> {
        let provider = self.get(name)?;
        check_connected(provider.as_ref())?;
        check_symbol(provider.as_ref(), symbol)?;
        provider.subscribe_order_book(symbol, depth).await?;
        self.track_subscription(name, SubscriptionKey::order_book(symbol, depth));
        Ok(())
    }

    pub async fn unsubscribe_order_book(&self, name: &str, symbol: &str) -> Result<()> {
        let provider = self.get(name)?;
        provider.unsubscribe_order_book(symbol).await?;
        // depth is part of the subscription key but unsubscribe drops by
        // symbol only, matching the provider trait's own shape.
        let mut lifecycles = self.lifecycles.lock();
        if let Some(ProviderLifecycle::Subscribed(set)) = lifecycles.get_mut(name) {
            set.retain(|k| !(k.stream_type == StreamType::OrderBook && k.symbol == symbol));
        }
        Ok(())
    }

    pub async fn subscribe_book_ticker(&self, name: &str, symbol: &str) -> Result<()> {
        let provider = self.get(name)?;
        check_connected(provider.as_ref())?;
        check_symbol(provider.as_ref(), symbol)?;
        provider.subscribe_book_ticker(symbol).await?;
        self.track_subscription(name, SubscriptionKey::book_ticker(symbol));
        Ok(())
    }

    pub async fn unsubscribe_book_ticker(&self, name: &str, symbol: &str) -> Result<()> {
        let provider = self.get(name)?;
        provider.unsubscribe_book_ticker(symbol).await?;
        self.untrack_subscription(name, &SubscriptionKey::book_ticker(symbol));
        Ok(())
    }

    /// Subscribes to some combination of trades, aggregate trades, order
    /// book (depth 20) and book ticker for `symbol` in one call
    /// (`/api/orderflow/subscribe/all`), gated by the caller-supplied
    /// `includes` flags.
    pub async fn subscribe_all_orderflow(&self, name: &str, symbol: &str, includes: OrderflowIncludes) -> Result<()> {
        if includes.trades {
            self.subscribe_trades(name, symbol).await?;
        }
        if includes.aggregate_trades {
            self.subscribe_aggregate_trades(name, symbol).await?;
        }
        if includes.order_book {
            self.subscribe_order_book(name, symbol, 20).await?;
        }
        if includes.book_ticker {
            self.subscribe_book_ticker(name, symbol).await?;
        }
        Ok(())
    }

    /// Runtime override of the order-book store's throttle interval, for
    /// `POST /api/orderflow/historical/orderbook/.../config/interval`.
    pub fn set_order_book_interval_s(&self, interval_s: i64) {
        self.order_books.set_interval_s(interval_s);
    }

    /// Runtime override of the order-book store's per-series cap, for
    /// `POST /api/orderflow/historical/orderbook/.../config/max`.
    pub fn set_order_book_max(&self, max: usize) {
        self.order_books.set_max(max);
    }

    /// Fetches historical candles from the provider and folds them into the
    /// candle store before returning them, so `store.latest` reflects the
    /// backfill and stays continuous with whatever the live ticker appends
    /// afterwards.
    pub async fn historical_klines(&self, name: &str, symbol: &str, interval: Interval, limit: usize) -> Result<Vec<crate::types::Candle>> {
        let provider = self.get(name)?;
        check_symbol(provider.as_ref(), symbol)?;
        let candles = provider.get_historical_klines(symbol, interval, limit).await?;
        self.candles.add_bulk(candles.iter().cloned());
        Ok(candles)
    }

    fn track_subscription(&self, name: &str, key: SubscriptionKey) {
        self.lifecycles.lock().entry(name.to_string()).or_default().add_subscription(key);
    }

    fn untrack_subscription(&self, name: &str, key: &SubscriptionKey) {
        if let Some(lifecycle) = self.lifecycles.lock().get_mut(name) {
            lifecycle.remove_subscription(key);
        }
    }

    /// Startup bootstrap: connects the default provider and
    /// subscribes to ticker + kline(default_interval) for every symbol in
    /// `config.bootstrap_symbols`, standing in for the union of symbols
    /// external strategy collaborators would otherwise declare.
    pub async fn bootstrap(&self) -> Result<()> {
        let provider_name = self.config.default_provider.clone();
        let interval = self.config.default_interval;
        self.connect(&provider_name).await?;

        for symbol in self.config.bootstrap_symbols.clone() {
            if let Err(e) = self.subscribe_ticker(&provider_name, &symbol).await {
                warn!(provider = %provider_name, %symbol, error = %e, "bootstrap ticker subscribe failed");
                continue;
            }
            if let Err(e) = self.subscribe_kline(&provider_name, &symbol, interval).await {
                warn!(provider = %provider_name, %symbol, error = %e, "bootstrap kline subscribe failed");
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn route_event(
    provider: &str,
    event: &DataEvent,
    candles: &CandleStore,
    trades: &TradeStore,
    order_books: &OrderBookStore,
    book_tickers: &BookTickerStore,
    footprint: &FootprintEngine,
    kline_subscriptions: &Mutex<HashMap<String, HashSet<Interval>>>,
) {
    match event {
        DataEvent::Ticker { .. } => {}
        DataEvent::Kline(candle) => candles.add(candle.clone()),
        DataEvent::Trade(trade) | DataEvent::AggregateTrade(trade) => {
            trades.add(trade.clone());
            let key = stream_key(provider, &trade.symbol);
            let intervals: Vec<Interval> = kline_subscriptions
                .lock()
                .get(&key)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for interval in intervals {
                footprint.on_trade(provider, &trade.symbol, interval, trade);
            }
        }
        DataEvent::OrderBook(snapshot) => {
            order_books.add(snapshot.clone());
        }
        DataEvent::BookTicker(snapshot) => {
            book_tickers.add(snapshot.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockProvider, Scenario};

    fn hub_with_mock() -> Arc<DispatchHub> {
        let hub = DispatchHub::new(Config::default());
        let provider = MockProvider::new("mock", vec!["BTCUSDT".to_string()], 20, 0.001, Scenario::Normal);
        hub.register(Arc::new(provider));
        hub
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let hub = DispatchHub::new(Config::default());
        let err = hub.connect("nope").await.unwrap_err();
        assert!(matches!(err, MarketDataError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn subscribing_before_connect_fails() {
        let hub = hub_with_mock();
        let err = hub.subscribe_ticker("mock", "BTCUSDT").await.unwrap_err();
        assert!(matches!(err, MarketDataError::NotConnected(_)));
    }

    #[tokio::test]
    async fn kline_events_populate_candle_store() {
        let hub = hub_with_mock();
        hub.connect("mock").await.unwrap();
        hub.subscribe_kline("mock", "BTCUSDT", Interval::OneMinute).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let latest = hub.candles().latest("mock", "BTCUSDT", Interval::OneMinute);
        assert!(latest.is_some());
    }

    #[tokio::test]
    async fn historical_klines_backfills_candle_store() {
        let hub = hub_with_mock();
        hub.connect("mock").await.unwrap();

        let fetched = hub.historical_klines("mock", "BTCUSDT", Interval::OneMinute, 10).await.unwrap();
        assert!(!fetched.is_empty());

        let stored = hub.candles().get("mock", "BTCUSDT", Interval::OneMinute);
        assert_eq!(stored.len(), fetched.len());
    }
}
