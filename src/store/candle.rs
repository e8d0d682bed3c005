//! Candle store: dedup-by-`open_time`, replace-on-match,
//! sorted ascending by `open_time`, bounded at `candle_max` (default 1000)
//! per `(provider, symbol, interval)` series.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::time::Interval;
use crate::types::{candle_key, Candle};

pub struct CandleStore {
    max_per_series: usize,
    series: RwLock<HashMap<String, VecDeque<Candle>>>,
}

impl CandleStore {
    pub fn new(max_per_series: usize) -> Self {
        Self {
            max_per_series,
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or replaces a candle in its series, keeping the series sorted
    /// ascending by `open_time` and capped at `max_per_series`.
    pub fn add(&self, candle: Candle) {
        let key = candle.key();
        let mut series = self.series.write();
        let deque = series.entry(key).or_default();
        insert_sorted(deque, candle, self.max_per_series);
    }

    pub fn add_bulk(&self, candles: impl IntoIterator<Item = Candle>) {
        for candle in candles {
            self.add(candle);
        }
    }

    pub fn get(&self, provider: &str, symbol: &str, interval: Interval) -> Vec<Candle> {
        let key = candle_key(provider, symbol, interval);
        self.series
            .read()
            .get(&key)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_n(&self, provider: &str, symbol: &str, interval: Interval, n: usize) -> Vec<Candle> {
        let key = candle_key(provider, symbol, interval);
        self.series
            .read()
            .get(&key)
            .map(|d| {
                let start = d.len().saturating_sub(n);
                d.iter().skip(start).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn range(
        &self,
        provider: &str,
        symbol: &str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> Vec<Candle> {
        let key = candle_key(provider, symbol, interval);
        self.series
            .read()
            .get(&key)
            .map(|d| {
                d.iter()
                    .filter(|c| c.open_time >= start_time && c.open_time <= end_time)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest(&self, provider: &str, symbol: &str, interval: Interval) -> Option<Candle> {
        let key = candle_key(provider, symbol, interval);
        self.series.read().get(&key).and_then(|d| d.back().cloned())
    }

    pub fn count(&self, provider: &str, symbol: &str, interval: Interval) -> usize {
        let key = candle_key(provider, symbol, interval);
        self.series.read().get(&key).map(|d| d.len()).unwrap_or(0)
    }
}

fn insert_sorted(deque: &mut VecDeque<Candle>, candle: Candle, max_len: usize) {
    if let Some(last) = deque.back() {
        if candle.open_time == last.open_time {
            *deque.back_mut().expect("checked Some above") = candle;
            return;
        }
        if candle.open_time > last.open_time {
            deque.push_back(candle);
            if deque.len() > max_len {
                deque.pop_front();
            }
            return;
        }
    } else {
        deque.push_back(candle);
        return;
    }

    // Out-of-order arrival (e.g. historical backfill): find the matching or
    // insertion position by linear scan from the back, since these are rare.
    match deque.iter().position(|c| c.open_time == candle.open_time) {
        Some(idx) => deque[idx] = candle,
        None => {
            let idx = deque.iter().position(|c| c.open_time > candle.open_time).unwrap_or(deque.len());
            deque.insert(idx, candle);
            if deque.len() > max_len {
                deque.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn candle(open_time: i64, close: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            provider: "mock".to_string(),
            interval: Interval::OneMinute,
            open_time,
            close_time: open_time + 60,
            open: Decimal::new(close, 0),
            high: Decimal::new(close, 0),
            low: Decimal::new(close, 0),
            close: Decimal::new(close, 0),
            volume: Decimal::ONE,
            quote_asset_volume: Decimal::ONE,
            number_of_trades: 1,
            closed: true,
        }
    }

    #[test]
    fn replaces_on_matching_open_time() {
        let store = CandleStore::new(1000);
        store.add(candle(60, 100));
        store.add(candle(60, 105));
        let all = store.get("mock", "BTCUSDT", Interval::OneMinute);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].close, Decimal::new(105, 0));
    }

    #[test]
    fn stays_sorted_and_bounded() {
        let store = CandleStore::new(3);
        for i in 0..5 {
            store.add(candle(i * 60, i));
        }
        let all = store.get("mock", "BTCUSDT", Interval::OneMinute);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].open_time, 120);
        assert_eq!(all.last().unwrap().open_time, 240);
        assert!(all.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }

    #[test]
    fn last_n_and_latest() {
        let store = CandleStore::new(1000);
        for i in 0..10 {
            store.add(candle(i * 60, i));
        }
        assert_eq!(store.last_n("mock", "BTCUSDT", Interval::OneMinute, 3).len(), 3);
        assert_eq!(store.latest("mock", "BTCUSDT", Interval::OneMinute).unwrap().open_time, 540);
        assert_eq!(store.count("mock", "BTCUSDT", Interval::OneMinute), 10);
    }
}
