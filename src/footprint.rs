//! Footprint builder: aggregates trades into a per-interval
//! buy/sell volume profile keyed by tick-aligned price, with point-of-control
//! and value-area (70% threshold) derived at close. Closed candles are kept
//! in a size-bounded completed cache; a periodic sweep closes candles whose
//! bucket has elapsed even without a trade to trigger the rotation inline.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::time::Interval;
use crate::types::{candle_key, Candle, FootprintCandle, PriceLevelVolume, Trade};

const COMPLETED_CACHE_BOUND: usize = 500;
const AUTO_CLOSE_SWEEP: Duration = Duration::from_secs(10);

struct BuildingFootprint {
    symbol: String,
    provider: String,
    interval: Interval,
    open_time: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    quote_asset_volume: Decimal,
    number_of_trades: u64,
    profile: BTreeMap<Decimal, PriceLevelVolume>,
}

impl BuildingFootprint {
    fn new(provider: &str, symbol: &str, interval: Interval, open_time: i64, first_price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            provider: provider.to_string(),
            interval,
            open_time,
            open: first_price,
            high: first_price,
            low: first_price,
            close: first_price,
            volume: Decimal::ZERO,
            quote_asset_volume: Decimal::ZERO,
            number_of_trades: 0,
            profile: BTreeMap::new(),
        }
    }

    fn apply_trade(&mut self, trade: &Trade, tick: Decimal) {
        let level_price = align_to_tick(trade.price, tick);
        let level = self
            .profile
            .entry(level_price)
            .or_insert_with(|| PriceLevelVolume::new(level_price));
        if trade.aggressive_buy {
            level.buy_volume += trade.quantity;
        } else {
            level.sell_volume += trade.quantity;
        }
        level.trade_count += 1;

        if trade.price > self.high {
            self.high = trade.price;
        }
        if trade.price < self.low {
            self.low = trade.price;
        }
        self.close = trade.price;
        self.volume += trade.quantity;
        self.quote_asset_volume += trade.quantity * trade.price;
        self.number_of_trades += 1;
    }

    fn totals(&self) -> (Decimal, Decimal) {
        self.profile.values().fold((Decimal::ZERO, Decimal::ZERO), |(buy, sell), l| {
            (buy + l.buy_volume, sell + l.sell_volume)
        })
    }

    fn build(&self, cumulative_delta: Decimal, closed: bool) -> FootprintCandle {
        let (total_buy, total_sell) = self.totals();
        let (poc, vah, val) = compute_value_area(&self.profile);
        FootprintCandle {
            candle: Candle {
                symbol: self.symbol.clone(),
                provider: self.provider.clone(),
                interval: self.interval,
                open_time: self.open_time,
                close_time: self.open_time + self.interval.seconds(),
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
                volume: self.volume,
                quote_asset_volume: self.quote_asset_volume,
                number_of_trades: self.number_of_trades,
                closed,
            },
            total_buy_volume: total_buy,
            total_sell_volume: total_sell,
            delta: total_buy - total_sell,
            cumulative_delta,
            volume_profile: self.profile.clone(),
            point_of_control: poc,
            value_area_high: vah,
            value_area_low: val,
        }
    }
}

fn align_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    (price / tick).round() * tick
}

/// Point-of-control and 70%-threshold value area over a price/volume
/// profile: start at the highest-volume level, then repeatedly extend
/// toward whichever neighboring level (above or below) holds more volume
/// until the included volume reaches 70% of the total.
fn compute_value_area(profile: &BTreeMap<Decimal, PriceLevelVolume>) -> (Option<Decimal>, Option<Decimal>, Option<Decimal>) {
    if profile.is_empty() {
        return (None, None, None);
    }
    let levels: Vec<(Decimal, Decimal)> = profile.iter().map(|(p, l)| (*p, l.total())).collect();
    let total_volume: Decimal = levels.iter().map(|(_, v)| *v).sum();
    if total_volume.is_zero() {
        return (Some(levels[0].0), Some(levels[0].0), Some(levels[0].0));
    }

    let poc_idx = levels
        .iter()
        .enumerate()
        .max_by(|(_, (_, a)), (_, (_, b))| a.cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let target = total_volume * Decimal::new(70, 2);
    let mut accumulated = levels[poc_idx].1;
    let mut low_idx = poc_idx;
    let mut high_idx = poc_idx;

    while accumulated < target && (low_idx > 0 || high_idx < levels.len() - 1) {
        let below = (low_idx > 0).then(|| levels[low_idx - 1].1);
        let above = (high_idx < levels.len() - 1).then(|| levels[high_idx + 1].1);

        match (below, above) {
            (Some(b), Some(a)) if b >= a => {
                low_idx -= 1;
                accumulated += b;
            }
            (Some(_), Some(a)) => {
                high_idx += 1;
                accumulated += a;
            }
            (Some(b), None) => {
                low_idx -= 1;
                accumulated += b;
            }
            (None, Some(a)) => {
                high_idx += 1;
                accumulated += a;
            }
            (None, None) => break,
        }
    }

    (Some(levels[poc_idx].0), Some(levels[high_idx].0), Some(levels[low_idx].0))
}

/// Aggregates trades into footprint candles per `(provider, symbol, interval)`.
pub struct FootprintEngine {
    config: Config,
    building: Mutex<HashMap<String, BuildingFootprint>>,
    completed: Mutex<HashMap<String, VecDeque<FootprintCandle>>>,
    /// Running intra-day delta per series, reset on the first candle of each
    /// UTC day (see DESIGN.md for this Open Question's resolution).
    cumulative: Mutex<HashMap<String, (i64, Decimal)>>,
    /// Runtime tick-size overrides set via `/api/footprint/tick-size`, take
    /// precedence over `config.symbol_tick_sizes`.
    tick_overrides: Mutex<HashMap<String, Decimal>>,
}

impl FootprintEngine {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            building: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            cumulative: Mutex::new(HashMap::new()),
            tick_overrides: Mutex::new(HashMap::new()),
        })
    }

    pub fn tick_size_for(&self, symbol: &str) -> Decimal {
        self.tick_overrides
            .lock()
            .get(symbol)
            .copied()
            .unwrap_or_else(|| self.config.tick_size_for(symbol))
    }

    pub fn set_tick_size(&self, symbol: &str, tick: Decimal) {
        self.tick_overrides.lock().insert(symbol.to_string(), tick);
    }

    pub fn on_trade(&self, provider: &str, symbol: &str, interval: Interval, trade: &Trade) {
        let tick = self.tick_size_for(symbol);
        let bucket_open = interval.bucket_start(trade.timestamp / 1000);
        let key = candle_key(provider, symbol, interval);

        let mut building = self.building.lock();
        if let Some(existing) = building.get(&key) {
            if existing.open_time != bucket_open {
                if let Some(prev) = building.remove(&key) {
                    drop(building);
                    self.finalize_and_store(key.clone(), prev);
                    building = self.building.lock();
                }
            }
        }
        let entry = building
            .entry(key)
            .or_insert_with(|| BuildingFootprint::new(provider, symbol, interval, bucket_open, trade.price));
        entry.apply_trade(trade, tick);
    }

    fn finalize_and_store(&self, key: String, building: BuildingFootprint) {
        let day_bucket = building.open_time.div_euclid(86_400);
        let delta = delta_of(&building);
        let cumulative_delta = self.advance_cumulative(&key, day_bucket, delta);
        let candle = building.build(cumulative_delta, true);

        let mut completed = self.completed.lock();
        let deque = completed.entry(key).or_default();
        deque.push_back(candle);
        if deque.len() > COMPLETED_CACHE_BOUND {
            deque.pop_front();
        }
    }

    fn advance_cumulative(&self, key: &str, day_bucket: i64, delta: Decimal) -> Decimal {
        let mut cumulative = self.cumulative.lock();
        let entry = cumulative.entry(key.to_string()).or_insert((day_bucket, Decimal::ZERO));
        if entry.0 != day_bucket {
            *entry = (day_bucket, Decimal::ZERO);
        }
        entry.1 += delta;
        entry.1
    }

    pub fn completed(&self, provider: &str, symbol: &str, interval: Interval, limit: usize) -> Vec<FootprintCandle> {
        let key = candle_key(provider, symbol, interval);
        self.completed
            .lock()
            .get(&key)
            .map(|d| {
                let start = d.len().saturating_sub(limit);
                d.iter().skip(start).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// The in-progress footprint candle, with a provisional (non-committed)
    /// cumulative delta preview.
    pub fn current(&self, provider: &str, symbol: &str, interval: Interval) -> Option<FootprintCandle> {
        let key = candle_key(provider, symbol, interval);
        let building = self.building.lock();
        let entry = building.get(&key)?;
        let day_bucket = entry.open_time.div_euclid(86_400);
        let base = {
            let cumulative = self.cumulative.lock();
            cumulative
                .get(&key)
                .filter(|(d, _)| *d == day_bucket)
                .map(|(_, v)| *v)
                .unwrap_or(Decimal::ZERO)
        };
        Some(entry.build(base + delta_of(entry), false))
    }

    /// Background task: closes any building footprint whose interval has
    /// elapsed, even if no trade has arrived to trigger the rotation inline.
    pub async fn run_auto_close_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(AUTO_CLOSE_SWEEP);
        loop {
            ticker.tick().await;
            self.sweep_expired();
        }
    }

    fn sweep_expired(&self) {
        let now = Utc::now().timestamp();
        let expired: Vec<String> = {
            let building = self.building.lock();
            building
                .iter()
                .filter(|(_, b)| now >= b.open_time + b.interval.seconds())
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in expired {
            let removed = self.building.lock().remove(&key);
            if let Some(removed) = removed {
                self.finalize_and_store(key, removed);
            }
        }
    }
}

fn delta_of(building: &BuildingFootprint) -> Decimal {
    let (buy, sell) = building.totals();
    buy - sell
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: i64, price: i64, qty: i64, buy: bool) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            provider: "mock".to_string(),
            timestamp: ts,
            price: Decimal::new(price, 0),
            quantity: Decimal::new(qty, 0),
            aggressive_buy: buy,
            trade_id: None,
        }
    }

    #[test]
    fn value_area_covers_at_least_70_percent() {
        let mut profile = BTreeMap::new();
        for (price, vol) in [(100, 10), (101, 50), (102, 20), (103, 5)] {
            let mut level = PriceLevelVolume::new(Decimal::new(price, 0));
            level.buy_volume = Decimal::new(vol, 0);
            profile.insert(Decimal::new(price, 0), level);
        }
        let (poc, vah, val) = compute_value_area(&profile);
        assert_eq!(poc, Some(Decimal::new(101, 0)));
        let total: Decimal = profile.values().map(|l| l.total()).sum();
        let included: Decimal = profile
            .range(val.unwrap()..=vah.unwrap())
            .map(|(_, l)| l.total())
            .sum();
        assert!(included / total >= Decimal::new(70, 2));
    }

    #[test]
    fn trades_aggregate_into_current_footprint() {
        let engine = FootprintEngine::new(Config::default());
        engine.on_trade("mock", "BTCUSDT", Interval::OneMinute, &trade(0, 100, 2, true));
        engine.on_trade("mock", "BTCUSDT", Interval::OneMinute, &trade(10_000, 100, 1, false));

        let current = engine.current("mock", "BTCUSDT", Interval::OneMinute).unwrap();
        assert_eq!(current.total_buy_volume, Decimal::new(2, 0));
        assert_eq!(current.total_sell_volume, Decimal::new(1, 0));
        assert_eq!(current.delta, Decimal::new(1, 0));
        assert!(!current.candle.closed);
    }

    #[test]
    fn tick_size_override_takes_precedence_over_config() {
        let engine = FootprintEngine::new(Config::default());
        assert_eq!(engine.tick_size_for("BTCUSDT"), Config::default().default_tick_size);
        engine.set_tick_size("BTCUSDT", Decimal::new(5, 1));
        assert_eq!(engine.tick_size_for("BTCUSDT"), Decimal::new(5, 1));
    }

    #[test]
    fn rotating_to_a_new_bucket_closes_the_previous_one() {
        let engine = FootprintEngine::new(Config::default());
        engine.on_trade("mock", "BTCUSDT", Interval::OneMinute, &trade(0, 100, 1, true));
        engine.on_trade("mock", "BTCUSDT", Interval::OneMinute, &trade(120_000, 101, 1, true));

        let completed = engine.completed("mock", "BTCUSDT", Interval::OneMinute, 10);
        assert_eq!(completed.len(), 1);
        assert!(completed[0].candle.closed);
        assert_eq!(completed[0].candle.open_time, 0);
    }
}
