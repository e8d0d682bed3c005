//! Provider abstraction and its per-provider subscription lifecycle
//! state machine.

pub mod exchange;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::MarketDataError;
use crate::time::Interval;
use crate::types::{BookTickerSnapshot, Candle, OrderBookSnapshot, Trade};

pub type Result<T> = std::result::Result<T, MarketDataError>;

/// Normalized event a provider emits into its sink. At-most-once per source
/// event, in per-symbol arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataEvent {
    Ticker {
        provider: String,
        symbol: String,
        price: Decimal,
        timestamp: i64,
    },
    Kline(Candle),
    Trade(Trade),
    AggregateTrade(Trade),
    OrderBook(OrderBookSnapshot),
    BookTicker(BookTickerSnapshot),
}

/// A provider's single data sink. `set_data_handler` replaces any prior
/// handler: this is an intentional single-sink contract at the provider
/// layer. Multi-subscriber fan-out lives one level up, in the dispatch hub
/// (`dispatch.rs`), which is *itself* the handler every provider is wired to.
pub type DataHandler = Arc<dyn Fn(DataEvent) + Send + Sync>;

/// A stream kind a provider can be subscribed to, used by the subscription
/// state machine below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Ticker,
    Kline,
    Trades,
    AggregateTrades,
    OrderBook,
    BookTicker,
}

/// One entry in a provider's `SUBSCRIBED` set: `(streamType, symbol[, interval|depth])`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub stream_type: StreamType,
    pub symbol: String,
    pub interval: Option<Interval>,
    pub depth: Option<u32>,
}

impl SubscriptionKey {
    pub fn ticker(symbol: impl Into<String>) -> Self {
        Self {
            stream_type: StreamType::Ticker,
            symbol: symbol.into(),
            interval: None,
            depth: None,
        }
    }

    pub fn kline(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            stream_type: StreamType::Kline,
            symbol: symbol.into(),
            interval: Some(interval),
            depth: None,
        }
    }

    pub fn trades(symbol: impl Into<String>) -> Self {
        Self {
            stream_type: StreamType::Trades,
            symbol: symbol.into(),
            interval: None,
            depth: None,
        }
    }

    pub fn aggregate_trades(symbol: impl Into<String>) -> Self {
        Self {
            stream_type: StreamType::AggregateTrades,
            symbol: symbol.into(),
            interval: None,
            depth: None,
        }
    }

    pub fn order_book(symbol: impl Into<String>, depth: u32) -> Self {
        Self {
            stream_type: StreamType::OrderBook,
            symbol: symbol.into(),
            interval: None,
            depth: Some(depth),
        }
    }

    pub fn book_ticker(symbol: impl Into<String>) -> Self {
        Self {
            stream_type: StreamType::BookTicker,
            symbol: symbol.into(),
            interval: None,
            depth: None,
        }
    }
}

/// `UNREGISTERED -> REGISTERED -> CONNECTED -> SUBSCRIBED(set)` with reverse
/// edges.
#[derive(Debug, Clone, Default)]
pub enum ProviderLifecycle {
    #[default]
    Unregistered,
    Registered,
    Connected,
    Subscribed(std::collections::HashSet<SubscriptionKey>),
}

impl ProviderLifecycle {
    pub fn register(&mut self) {
        if matches!(self, ProviderLifecycle::Unregistered) {
            *self = ProviderLifecycle::Registered;
        }
    }

    pub fn mark_connected(&mut self) {
        match self {
            ProviderLifecycle::Unregistered | ProviderLifecycle::Registered => {
                *self = ProviderLifecycle::Connected;
            }
            ProviderLifecycle::Subscribed(_) => {}
            ProviderLifecycle::Connected => {}
        }
    }

    pub fn mark_disconnected(&mut self) {
        match self {
            ProviderLifecycle::Connected | ProviderLifecycle::Subscribed(_) => {
                *self = ProviderLifecycle::Registered;
            }
            other => {
                // Already below CONNECTED; disconnect is idempotent.
                let _ = other;
            }
        }
    }

    pub fn add_subscription(&mut self, key: SubscriptionKey) {
        match self {
            ProviderLifecycle::Subscribed(set) => {
                set.insert(key);
            }
            _ => {
                let mut set = std::collections::HashSet::new();
                set.insert(key);
                *self = ProviderLifecycle::Subscribed(set);
            }
        }
    }

    pub fn remove_subscription(&mut self, key: &SubscriptionKey) {
        if let ProviderLifecycle::Subscribed(set) = self {
            set.remove(key);
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ProviderLifecycle::Connected | ProviderLifecycle::Subscribed(_)
        )
    }
}

/// The provider contract every market-data source (exchange or mock)
/// implements.
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn supported_symbols(&self) -> Vec<String>;
    fn supported_intervals(&self) -> Vec<Interval>;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    async fn subscribe(&self, symbol: &str) -> Result<()>;
    async fn unsubscribe(&self, symbol: &str) -> Result<()>;

    async fn subscribe_kline(&self, symbol: &str, interval: Interval) -> Result<()>;
    async fn unsubscribe_kline(&self, symbol: &str, interval: Interval) -> Result<()>;

    async fn subscribe_trades(&self, symbol: &str) -> Result<()>;
    async fn unsubscribe_trades(&self, symbol: &str) -> Result<()>;

    async fn subscribe_aggregate_trades(&self, symbol: &str) -> Result<()>;
    async fn unsubscribe_aggregate_trades(&self, symbol: &str) -> Result<()>;

    async fn subscribe_order_book(&self, symbol: &str, depth: u32) -> Result<()>;
    async fn unsubscribe_order_book(&self, symbol: &str) -> Result<()>;

    async fn subscribe_book_ticker(&self, symbol: &str) -> Result<()>;
    async fn unsubscribe_book_ticker(&self, symbol: &str) -> Result<()>;

    fn set_data_handler(&self, handler: DataHandler);

    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    async fn get_historical_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>>;

    async fn get_historical_aggregate_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Trade>>;

    async fn get_historical_order_book_snapshot(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<OrderBookSnapshot>>;
}

pub fn check_symbol(provider: &dyn Provider, symbol: &str) -> Result<()> {
    if provider.supported_symbols().iter().any(|s| s == symbol) {
        Ok(())
    } else {
        Err(MarketDataError::UnknownSymbol(symbol.to_string()))
    }
}

pub fn check_connected(provider: &dyn Provider) -> Result<()> {
    if provider.is_connected() {
        Ok(())
    } else {
        Err(MarketDataError::NotConnected(
            provider.provider_name().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_forward_and_back() {
        let mut lifecycle = ProviderLifecycle::default();
        lifecycle.register();
        assert!(matches!(lifecycle, ProviderLifecycle::Registered));
        lifecycle.mark_connected();
        assert!(lifecycle.is_connected());

        let key = SubscriptionKey::ticker("BTCUSDT");
        lifecycle.add_subscription(key.clone());
        assert!(matches!(lifecycle, ProviderLifecycle::Subscribed(_)));
        assert!(lifecycle.is_connected());

        lifecycle.remove_subscription(&key);
        lifecycle.mark_disconnected();
        assert!(!lifecycle.is_connected());

        // disconnect is idempotent
        lifecycle.mark_disconnected();
        assert!(!lifecycle.is_connected());
    }
}
