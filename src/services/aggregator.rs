//! Bucket aggregation: per-site sum/count/average over one window.

use crate::db::models::{NewDailyConsumption, NewHourlyConsumption};
use crate::db::store::{SiteTotals, StorageError, StorageTx};
use crate::window::{format_ts, Window};
use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    /// `end <= start`; a caller error, never retried.
    InvalidWindow { start: DateTime<Utc>, end: DateTime<Utc> },
    /// Any failure of the storage layer while reading or writing a window.
    Storage(StorageError),
}

impl Display for AggregationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AggregationError::InvalidWindow { start, end } => write!(
                f,
                "invalid window: end {} is not after start {}",
                format_ts(*end),
                format_ts(*start)
            ),
            AggregationError::Storage(e) => write!(f, "storage failure: {}", e),
        }
    }
}

impl Error for AggregationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AggregationError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for AggregationError {
    fn from(value: StorageError) -> Self {
        AggregationError::Storage(value)
    }
}

/// Hourly average: absent when nothing was counted.
pub fn hourly_average(total_kwh: f64, count: i64) -> Option<f64> {
    (count > 0).then(|| total_kwh / count as f64)
}

/// Daily average per hour with data: exactly 0 when no hour had data.
pub fn daily_average(total_kwh: f64, hours_with_data: i64) -> f64 {
    if hours_with_data > 0 {
        total_kwh / hours_with_data as f64
    } else {
        0.0
    }
}

fn ensure_valid(window: &Window) -> Result<(), AggregationError> {
    Window::new(window.start, window.end).map(|_| ())
}

/// Aggregates unconsumed readings in `window` into one row per site.
///
/// Readings already marked consumed are excluded, so re-running a window
/// before its transaction commits never double counts. An empty result is the
/// normal "nothing to do" case.
pub fn aggregate_hourly<T: StorageTx>(
    tx: &mut T,
    window: &Window,
    processed_at: DateTime<Utc>,
) -> Result<Vec<NewHourlyConsumption>, AggregationError> {
    ensure_valid(window)?;
    let totals = tx.sum_unconsumed_readings(window)?;
    debug!("Hourly {}: {} site(s) with unconsumed readings", window, totals.len());
    Ok(totals
        .into_iter()
        .map(|SiteTotals { site_id, total_kwh, count }| NewHourlyConsumption {
            site_id,
            bucket_start: window.start,
            total_kwh,
            reading_count: count,
            average_kwh: hourly_average(total_kwh, count),
            processed_at,
        })
        .collect())
}

/// Folds the hourly rows of `date` (and only that UTC day) into one row per site.
pub fn aggregate_daily<T: StorageTx>(
    tx: &mut T,
    date: NaiveDate,
    processed_at: DateTime<Utc>,
) -> Result<Vec<NewDailyConsumption>, AggregationError> {
    let window = Window::day(date);
    ensure_valid(&window)?;
    let totals = tx.sum_hourly(&window)?;
    debug!("Daily {}: {} site(s) with hourly data", date, totals.len());
    Ok(totals
        .into_iter()
        .map(|SiteTotals { site_id, total_kwh, count }| NewDailyConsumption {
            site_id,
            bucket_date: date,
            total_kwh,
            hours_with_data: count,
            average_per_hour_kwh: daily_average(total_kwh, count),
            processed_at,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::store::Storage;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn average_semantics_differ_between_layers() {
        assert_eq!(hourly_average(5.0, 2), Some(2.5));
        assert_eq!(hourly_average(0.0, 0), None);
        assert_eq!(daily_average(12.0, 3), 4.0);
        assert_eq!(daily_average(0.0, 0), 0.0);
    }

    #[test]
    fn hourly_groups_by_site_and_skips_consumed_rows() {
        let mut store = MemoryStore::default();
        store.add_reading(1, at(10, 5), 2.0);
        store.add_reading(1, at(10, 40), 3.0);
        store.add_reading(2, at(10, 59), 1.5);
        store.add_consumed_reading(2, at(10, 30), 100.0);
        store.add_reading(1, at(11, 0), 7.0);

        let mut tx = store.begin().unwrap();
        let rows = aggregate_hourly(&mut tx, &Window::hour(at(10, 0)), at(12, 0)).unwrap();
        tx.rollback().unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].site_id, 1);
        assert_eq!(rows[0].total_kwh, 5.0);
        assert_eq!(rows[0].reading_count, 2);
        assert_eq!(rows[0].average_kwh, Some(2.5));
        assert_eq!(rows[0].bucket_start, at(10, 0));
        assert_eq!(rows[1].site_id, 2);
        assert_eq!(rows[1].total_kwh, 1.5);
        assert_eq!(rows[1].reading_count, 1);
    }

    #[test]
    fn empty_window_is_not_an_error() {
        let mut store = MemoryStore::default();
        let mut tx = store.begin().unwrap();
        let rows = aggregate_hourly(&mut tx, &Window::hour(at(3, 0)), at(4, 0)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn rejects_invalid_window_before_touching_storage() {
        let mut store = MemoryStore::default();
        store.add_reading(1, at(10, 5), 2.0);
        let mut tx = store.begin().unwrap();
        let bad = Window {
            start: at(11, 0),
            end: at(10, 0),
        };
        let err = aggregate_hourly(&mut tx, &bad, at(12, 0)).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidWindow { .. }));
    }

    #[test]
    fn daily_reads_only_its_own_day() {
        let mut store = MemoryStore::default();
        let day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        store.add_hourly(1, Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap(), 50.0, 4);
        store.add_hourly(1, at(0, 0), 1.0, 3);
        store.add_hourly(1, at(23, 0), 2.0, 3);
        store.add_hourly(2, at(12, 0), 4.0, 2);
        store.add_hourly(1, Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap(), 60.0, 4);

        let mut tx = store.begin().unwrap();
        let rows = aggregate_daily(&mut tx, day, at(23, 59)).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].site_id, 1);
        assert_eq!(rows[0].bucket_date, day);
        assert_eq!(rows[0].total_kwh, 3.0);
        assert_eq!(rows[0].hours_with_data, 2);
        assert_eq!(rows[0].average_per_hour_kwh, 1.5);
        assert_eq!(rows[1].site_id, 2);
        assert_eq!(rows[1].hours_with_data, 1);
        assert_eq!(rows[1].average_per_hour_kwh, 4.0);
    }
}
