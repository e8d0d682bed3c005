//! Book-ticker store: throttled to at most one snapshot per
//! `book_ticker_interval_ms` per `(provider, symbol)`, bounded at
//! `book_ticker_max` (default 3600), plus rolling spread/imbalance analytics.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;

use crate::types::{stream_key, BookTickerSnapshot};

pub struct BookTickerStore {
    max_per_series: usize,
    interval_ms: i64,
    series: RwLock<HashMap<String, VecDeque<BookTickerSnapshot>>>,
}

impl BookTickerStore {
    pub fn new(max_per_series: usize, interval_ms: i64) -> Self {
        Self {
            max_per_series,
            interval_ms: interval_ms.max(0),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, snapshot: BookTickerSnapshot) -> bool {
        let key = snapshot.key();
        let mut series = self.series.write();
        let deque = series.entry(key).or_default();

        if let Some(last) = deque.back() {
            if snapshot.timestamp - last.timestamp < self.interval_ms {
                return false;
            }
        }

        deque.push_back(snapshot);
        if deque.len() > self.max_per_series {
            deque.pop_front();
        }
        true
    }

    pub fn get(&self, provider: &str, symbol: &str) -> Vec<BookTickerSnapshot> {
        let key = stream_key(provider, symbol);
        self.series
            .read()
            .get(&key)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, provider: &str, symbol: &str) -> Option<BookTickerSnapshot> {
        let key = stream_key(provider, symbol);
        self.series.read().get(&key).and_then(|d| d.back().cloned())
    }

    pub fn last_n(&self, provider: &str, symbol: &str, n: usize) -> Vec<BookTickerSnapshot> {
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

    pub fn range(&self, provider: &str, symbol: &str, start_ms: i64, end_ms: i64) -> Vec<BookTickerSnapshot> {
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

    /// Mean spread over the last `n` snapshots (the whole series if `n` is
    /// `None` or exceeds the series length).
    pub fn average_spread(&self, provider: &str, symbol: &str, n: Option<usize>) -> Option<f64> {
        self.fold_series(provider, symbol, n, |s| s.spread().to_f64())
    }

    /// Mean spread in basis points over the last `n` snapshots.
    pub fn average_spread_bps(&self, provider: &str, symbol: &str, n: Option<usize>) -> Option<f64> {
        self.fold_series(provider, symbol, n, |s| Some(s.spread_bps()))
    }

    /// Average imbalance over the last `n` snapshots, excluding the
    /// `IMBALANCE_SENTINEL` values that mark a zero-ask-quantity snapshot.
    pub fn average_imbalance(&self, provider: &str, symbol: &str, n: Option<usize>) -> Option<f64> {
        self.fold_series(provider, symbol, n, |s| {
            let v = s.imbalance();
            if v >= 100.0 {
                None
            } else {
                Some(v)
            }
        })
    }

    /// Snapshots, among the last `n`, whose `spread_bps` exceeds `k` times
    /// the window's own average.
    pub fn detect_spread_anomalies(&self, provider: &str, symbol: &str, n: usize, k: f64) -> Vec<BookTickerSnapshot> {
        let Some(avg) = self.average_spread_bps(provider, symbol, Some(n)) else {
            return Vec::new();
        };
        if avg <= 0.0 {
            return Vec::new();
        }
        let key = stream_key(provider, symbol);
        self.series
            .read()
            .get(&key)
            .map(|d| {
                let start = d.len().saturating_sub(n);
                d.iter()
                    .skip(start)
                    .filter(|s| s.spread_bps() > avg * k)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self, provider: &str, symbol: &str) {
        let key = stream_key(provider, symbol);
        self.series.write().remove(&key);
    }

    fn fold_series<F>(&self, provider: &str, symbol: &str, n: Option<usize>, f: F) -> Option<f64>
    where
        F: Fn(&BookTickerSnapshot) -> Option<f64>,
    {
        let key = stream_key(provider, symbol);
        let series = self.series.read();
        let deque = series.get(&key)?;
        let start = match n {
            Some(n) => deque.len().saturating_sub(n),
            None => 0,
        };
        let (sum, count) = deque
            .iter()
            .skip(start)
            .filter_map(|s| f(s))
            .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceQty;
    use rust_decimal::Decimal;

    fn snapshot(ts: i64, bid: i64, ask: i64) -> BookTickerSnapshot {
        BookTickerSnapshot {
            symbol: "BTCUSDT".to_string(),
            provider: "mock".to_string(),
            timestamp: ts,
            best_bid: PriceQty {
                price: Decimal::new(bid, 0),
                quantity: Decimal::ONE,
            },
            best_ask: PriceQty {
                price: Decimal::new(ask, 0),
                quantity: Decimal::ONE,
            },
        }
    }

    #[test]
    fn throttles_by_millis() {
        let store = BookTickerStore::new(3600, 1000);
        assert!(store.add(snapshot(0, 100, 101)));
        assert!(!store.add(snapshot(500, 100, 101)));
        assert!(store.add(snapshot(1000, 100, 101)));
    }

    #[test]
    fn averages_and_anomaly_detection() {
        let store = BookTickerStore::new(3600, 0);
        store.add(snapshot(0, 100, 101));
        store.add(snapshot(1, 100, 101));
        store.add(snapshot(2, 100, 150)); // wide spread anomaly
        let avg = store.average_spread_bps("mock", "BTCUSDT", None).unwrap();
        assert!(avg > 0.0);
        let anomalies = store.detect_spread_anomalies("mock", "BTCUSDT", 1000, 3.0);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].best_ask.price, Decimal::new(150, 0));
    }

    #[test]
    fn imbalance_average_excludes_sentinel() {
        let store = BookTickerStore::new(3600, 0);
        let mut zero_ask = snapshot(0, 100, 101);
        zero_ask.best_ask.quantity = Decimal::ZERO;
        store.add(zero_ask);
        store.add(snapshot(1, 100, 101));
        // Only the second snapshot (imbalance == 1.0) contributes.
        assert_eq!(store.average_imbalance("mock", "BTCUSDT", None), Some(1.0));
    }

    #[test]
    fn lookback_window_limits_averages_and_anomaly_detection() {
        let store = BookTickerStore::new(3600, 0);
        store.add(snapshot(0, 100, 150)); // would be an anomaly if included
        store.add(snapshot(1, 100, 101));
        store.add(snapshot(2, 100, 101));

        // Windowed to the last 2 snapshots, the wide-spread outlier falls
        // outside the lookback and the average stays tight.
        let avg = store.average_spread_bps("mock", "BTCUSDT", Some(2)).unwrap();
        let anomalies = store.detect_spread_anomalies("mock", "BTCUSDT", 2, 2.0);
        assert!(anomalies.is_empty());
        assert!(avg < store.average_spread_bps("mock", "BTCUSDT", None).unwrap());
    }
}
