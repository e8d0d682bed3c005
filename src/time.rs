//! Interval parsing and epoch-alignment bucket math.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MarketDataError;

/// A candle/kline interval. Ordered the way exchanges canonically list them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    EightHours,
    TwelveHours,
    OneDay,
    ThreeDays,
    OneWeek,
    OneMonth,
}

impl Interval {
    pub const ALL: [Interval; 15] = [
        Interval::OneMinute,
        Interval::ThreeMinutes,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::TwoHours,
        Interval::FourHours,
        Interval::SixHours,
        Interval::EightHours,
        Interval::TwelveHours,
        Interval::OneDay,
        Interval::ThreeDays,
        Interval::OneWeek,
        Interval::OneMonth,
    ];

    /// Canonical label, e.g. "1m", "1h", "1mo".
    pub fn label(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::SixHours => "6h",
            Interval::EightHours => "8h",
            Interval::TwelveHours => "12h",
            Interval::OneDay => "1d",
            Interval::ThreeDays => "3d",
            Interval::OneWeek => "1w",
            Interval::OneMonth => "1mo",
        }
    }

    /// Interval length in whole seconds. "1mo" is modelled as 30 days exactly;
    /// calendar-month alignment is out of scope.
    pub fn seconds(&self) -> i64 {
        match self {
            Interval::OneMinute => 60,
            Interval::ThreeMinutes => 3 * 60,
            Interval::FiveMinutes => 5 * 60,
            Interval::FifteenMinutes => 15 * 60,
            Interval::ThirtyMinutes => 30 * 60,
            Interval::OneHour => 3600,
            Interval::TwoHours => 2 * 3600,
            Interval::FourHours => 4 * 3600,
            Interval::SixHours => 6 * 3600,
            Interval::EightHours => 8 * 3600,
            Interval::TwelveHours => 12 * 3600,
            Interval::OneDay => 86_400,
            Interval::ThreeDays => 3 * 86_400,
            Interval::OneWeek => 7 * 86_400,
            Interval::OneMonth => 30 * 86_400,
        }
    }

    pub fn parse(label: &str) -> Result<Self, MarketDataError> {
        Self::ALL
            .iter()
            .copied()
            .find(|i| i.label() == label)
            .ok_or_else(|| MarketDataError::InvalidInterval(label.to_string()))
    }

    /// `bucketStart(t, I) = floor(t / I) * I`.
    pub fn bucket_start(&self, epoch_seconds: i64) -> i64 {
        bucket_start(epoch_seconds, self.seconds())
    }

    pub fn bucket_start_millis(&self, epoch_millis: i64) -> i64 {
        bucket_start(epoch_millis / 1000, self.seconds())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// `floor(t / interval_seconds) * interval_seconds`, defined for any positive
/// `interval_seconds` and any `t` (including negative, via Euclidean floor).
pub fn bucket_start(epoch_seconds: i64, interval_seconds: i64) -> i64 {
    epoch_seconds.div_euclid(interval_seconds) * interval_seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_canonical_labels() {
        for interval in Interval::ALL {
            assert_eq!(Interval::parse(interval.label()).unwrap(), interval);
        }
    }

    #[test]
    fn rejects_unknown_label() {
        let err = Interval::parse("7z").unwrap_err();
        assert_eq!(err, MarketDataError::InvalidInterval("7z".to_string()));
    }

    #[test]
    fn bucket_start_aligns_to_interval() {
        assert_eq!(bucket_start(125, 60), 120);
        assert_eq!(bucket_start(1_700_000_000, 60), 1_700_000_000 / 60 * 60);
    }

    #[test]
    fn one_month_is_thirty_days() {
        assert_eq!(Interval::OneMonth.seconds(), 30 * 86_400);
    }
}
