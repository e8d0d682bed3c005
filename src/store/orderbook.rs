//! Order-book snapshot store: throttled to at most one
//! snapshot per `order_book_interval_s` seconds per `(provider, symbol)`,
//! bounded at `order_book_max` (default 1000).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::types::{stream_key, OrderBookSnapshot};

pub struct OrderBookStore {
    max_per_series: AtomicUsize,
    interval_ms: AtomicI64,
    series: RwLock<HashMap<String, VecDeque<OrderBookSnapshot>>>,
}

impl OrderBookStore {
    pub fn new(max_per_series: usize, interval_s: i64) -> Self {
        Self {
            max_per_series: AtomicUsize::new(max_per_series),
            interval_ms: AtomicI64::new(interval_s.max(0) * 1000),
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Stores `snapshot` unless a snapshot for the same key arrived less
    /// than `interval_ms` ago, in which case it's silently dropped. Returns
    /// whether it was stored.
    pub fn add(&self, snapshot: OrderBookSnapshot) -> bool {
        let key = snapshot.key();
        let mut series = self.series.write();
        let deque = series.entry(key).or_default();

        let interval_ms = self.interval_ms.load(Ordering::Relaxed);
        if let Some(last) = deque.back() {
            if snapshot.timestamp - last.timestamp < interval_ms {
                return false;
            }
        }

        deque.push_back(snapshot);
        let max_per_series = self.max_per_series.load(Ordering::Relaxed);
        if deque.len() > max_per_series {
            deque.pop_front();
        }
        true
    }

    pub fn get(&self, provider: &str, symbol: &str) -> Vec<OrderBookSnapshot> {
        let key = stream_key(provider, symbol);
        self.series
            .read()
            .get(&key)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_n(&self, provider: &str, symbol: &str, n: usize) -> Vec<OrderBookSnapshot> {
        let key = stream_key(provider, symbol);
        self.series
            .read()
            .get(&key)
            .map(|d| {
                let start = d.len().saturating_sub(n);
                d.iter().skip(start).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn range(&self, provider: &str, symbol: &str, start_ms: i64, end_ms: i64) -> Vec<OrderBookSnapshot> {
        let key = stream_key(provider, symbol);
        self.series
            .read()
            .get(&key)
            .map(|d| {
                d.iter()
                    .filter(|s| s.timestamp >= start_ms && s.timestamp <= end_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest(&self, provider: &str, symbol: &str) -> Option<OrderBookSnapshot> {
        let key = stream_key(provider, symbol);
        self.series.read().get(&key).and_then(|d| d.back().cloned())
    }

    /// Most recent snapshot at or before `time_ms`.
    pub fn at(&self, provider: &str, symbol: &str, time_ms: i64) -> Option<OrderBookSnapshot> {
        let key = stream_key(provider, symbol);
        self.series
            .read()
            .get(&key)
            .and_then(|d| d.iter().rev().find(|s| s.timestamp <= time_ms).cloned())
    }

    pub fn clear(&self, provider: &str, symbol: &str) {
        let key = stream_key(provider, symbol);
        self.series.write().remove(&key);
    }

    /// Runtime override of the throttle interval (seconds), for
    /// `POST …/config/interval`.
    pub fn set_interval_s(&self, interval_s: i64) {
        self.interval_ms.store(interval_s.max(0) * 1000, Ordering::Relaxed);
    }

    /// Runtime override of the per-series cap, for `POST …/config/max`.
    pub fn set_max(&self, max_per_series: usize) {
        self.max_per_series.store(max_per_series, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn snapshot(ts: i64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            provider: "mock".to_string(),
            timestamp: ts,
            bids: vec![crate::types::PriceQty {
                price: Decimal::ONE,
                quantity: Decimal::ONE,
            }],
            asks: vec![crate::types::PriceQty {
                price: Decimal::new(2, 0),
                quantity: Decimal::ONE,
            }],
        }
    }

    #[test]
    fn throttles_by_interval() {
        let store = OrderBookStore::new(1000, 10);
        assert!(store.add(snapshot(0)));
        assert!(!store.add(snapshot(5_000)));
        assert!(store.add(snapshot(10_000)));
        assert_eq!(store.get("mock", "BTCUSDT").len(), 2);
    }

    #[test]
    fn at_returns_most_recent_at_or_before() {
        let store = OrderBookStore::new(1000, 0);
        store.add(snapshot(0));
        store.add(snapshot(10));
        store.add(snapshot(20));
        assert_eq!(store.at("mock", "BTCUSDT", 15).unwrap().timestamp, 10);
        assert!(store.at("mock", "BTCUSDT", -1).is_none());
    }

    #[test]
    fn runtime_config_overrides_take_effect() {
        let store = OrderBookStore::new(1000, 10);
        store.set_interval_s(0);
        assert!(store.add(snapshot(0)));
        assert!(store.add(snapshot(1)));

        store.set_max(1);
        store.add(snapshot(2));
        assert_eq!(store.get("mock", "BTCUSDT").len(), 1);
    }
}
