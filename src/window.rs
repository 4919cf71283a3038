//! Aggregation windows and the two bucket granularities.

use crate::services::aggregator::AggregationError;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, Timelike, Utc};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Bucket size of an aggregate layer. Daily buckets are folded from hourly ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    pub fn name(self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }

    /// Postgres advisory lock key; one per granularity.
    pub fn lock_key(self) -> i64 {
        match self {
            Granularity::Hourly => 0x454E_5247_0001,
            Granularity::Daily => 0x454E_5247_0002,
        }
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AggregationError> {
        if end <= start {
            return Err(AggregationError::InvalidWindow { start, end });
        }
        Ok(Window { start, end })
    }

    /// The hour beginning at `start`, which must already be hour-aligned.
    pub fn hour(start: DateTime<Utc>) -> Self {
        Window {
            start,
            end: start + Duration::hours(1),
        }
    }

    /// `[date 00:00, date+1 00:00)` in UTC.
    pub fn day(date: NaiveDate) -> Self {
        let start = day_start(date);
        Window {
            start,
            end: start + Duration::days(1),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_ts(self.start), format_ts(self.end))
    }
}

pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let into_hour = Duration::minutes(i64::from(ts.minute()))
        + Duration::seconds(i64::from(ts.second()))
        + Duration::nanoseconds(i64::from(ts.nanosecond()));
    ts - into_hour
}

pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncates_to_hour_boundary() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 2, 10, 40, 17).unwrap() + Duration::milliseconds(250);
        assert_eq!(
            truncate_to_hour(ts),
            Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap()
        );

        let aligned = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(truncate_to_hour(aligned), aligned);
    }

    #[test]
    fn rejects_empty_and_inverted_windows() {
        let start = Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap();
        assert!(matches!(
            Window::new(start, start),
            Err(AggregationError::InvalidWindow { .. })
        ));
        assert!(matches!(
            Window::new(start, start - Duration::minutes(1)),
            Err(AggregationError::InvalidWindow { .. })
        ));
        assert!(Window::new(start, start + Duration::seconds(1)).is_ok());
    }

    #[test]
    fn day_window_is_half_open() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let w = Window::day(date);
        assert!(w.contains(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()));
        assert!(w.contains(Utc.with_ymd_and_hms(2024, 3, 2, 23, 0, 0).unwrap()));
        assert!(!w.contains(Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap()));
        assert!(!w.contains(Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap()));
        assert_eq!(w.to_string(), "[2024-03-02T00:00:00Z, 2024-03-03T00:00:00Z)");
    }
}
