//! Trade store: append-only per `(provider, symbol)` series,
//! sorted by timestamp, bounded at `trade_max` (default 1,000,000), with
//! dedup by `(timestamp, price, quantity)` on bulk insert.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::types::{stream_key, Trade};

pub struct TradeStore {
    max_per_series: usize,
    series: RwLock<HashMap<String, VecDeque<Trade>>>,
}

impl TradeStore {
    pub fn new(max_per_series: usize) -> Self {
        Self {
            max_per_series,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, trade: Trade) {
        let key = trade.key();
        let mut series = self.series.write();
        let deque = series.entry(key).or_default();
        push_sorted(deque, trade, self.max_per_series);
    }

    /// Bulk insert with dedup by `(timestamp, price, quantity)` against
    /// both the incoming batch and what's already stored.
    pub fn add_bulk(&self, trades: impl IntoIterator<Item = Trade>) {
        let mut seen: HashSet<(i64, Decimal, Decimal)> = HashSet::new();
        let mut by_key: HashMap<String, Vec<Trade>> = HashMap::new();
        for trade in trades {
            if seen.insert(trade.signature()) {
                by_key.entry(trade.key()).or_default().push(trade);
            }
        }

        let mut series = self.series.write();
        for (key, mut batch) in by_key {
            batch.sort_by_key(|t| t.timestamp);
            let deque = series.entry(key).or_default();
            let existing: HashSet<(i64, Decimal, Decimal)> = deque.iter().map(|t| t.signature()).collect();
            for trade in batch {
                if !existing.contains(&trade.signature()) {
                    push_sorted(deque, trade, self.max_per_series);
                }
            }
        }
    }

    pub fn get(&self, provider: &str, symbol: &str) -> Vec<Trade> {
        let key = stream_key(provider, symbol);
        self.series
            .read()
            .get(&key)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_n(&self, provider: &str, symbol: &str, n: usize) -> Vec<Trade> {
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

    pub fn range(&self, provider: &str, symbol: &str, start_ms: i64, end_ms: i64) -> Vec<Trade> {
        let key = stream_key(provider, symbol);
        self.series
            .read()
            .get(&key)
            .map(|d| {
                d.iter()
                    .filter(|t| t.timestamp >= start_ms && t.timestamp <= end_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, provider: &str, symbol: &str) -> usize {
        let key = stream_key(provider, symbol);
        self.series.read().get(&key).map(|d| d.len()).unwrap_or(0)
    }

    pub fn clear(&self, provider: &str, symbol: &str) {
        let key = stream_key(provider, symbol);
        self.series.write().remove(&key);
    }
}

fn push_sorted(deque: &mut VecDeque<Trade>, trade: Trade, max_len: usize) {
    match deque.back() {
        Some(last) if trade.timestamp >= last.timestamp => deque.push_back(trade),
        None => deque.push_back(trade),
        Some(_) => {
            let idx = deque.iter().position(|t| t.timestamp > trade.timestamp).unwrap_or(deque.len());
            deque.insert(idx, trade);
        }
    }
    if deque.len() > max_len {
        deque.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn trade(ts: i64, price: i64) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            provider: "mock".to_string(),
            timestamp: ts,
            price: Decimal::new(price, 0),
            quantity: Decimal::ONE,
            aggressive_buy: true,
            trade_id: None,
        }
    }

    #[test]
    fn bulk_insert_dedups_by_signature() {
        let store = TradeStore::new(1_000_000);
        store.add_bulk(vec![trade(1, 100), trade(1, 100), trade(2, 101)]);
        assert_eq!(store.count("mock", "BTCUSDT"), 2);
    }

    #[test]
    fn bound_evicts_oldest() {
        let store = TradeStore::new(3);
        for i in 0..5 {
            store.add(trade(i, i));
        }
        let all = store.get("mock", "BTCUSDT");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, 2);
    }
}
