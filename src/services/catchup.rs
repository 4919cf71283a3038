//! Catch-up: finds every window between the last aggregate produced and the
//! newest complete bucket of source data, and processes them in order.
//!
//! Windows run strictly one after another and the run stops at the first
//! failed window, so the aggregate tables never have holes behind their
//! watermark. The watermark itself is always recomputed from the aggregate
//! tables.

use crate::db::store::Storage;
use crate::services::aggregator::AggregationError;
use crate::services::processor::{process_daily, process_hourly, WindowOutcome};
use crate::window::{format_ts, truncate_to_hour, Granularity};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::num::NonZeroUsize;

pub const DEFAULT_MAX_HOURLY_WINDOWS: usize = 99_999 * 7;
pub const DEFAULT_MAX_DAILY_WINDOWS: usize = 1_000_000;

/// Upper bound on windows processed by a single catch-up invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchupLimits {
    pub max_hourly_windows: NonZeroUsize,
    pub max_daily_windows: NonZeroUsize,
}

impl Default for CatchupLimits {
    fn default() -> Self {
        CatchupLimits {
            max_hourly_windows: NonZeroUsize::new(DEFAULT_MAX_HOURLY_WINDOWS).unwrap_or(NonZeroUsize::MIN),
            max_daily_windows: NonZeroUsize::new(DEFAULT_MAX_DAILY_WINDOWS).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl CatchupLimits {
    pub fn for_granularity(&self, granularity: Granularity) -> usize {
        match granularity {
            Granularity::Hourly => self.max_hourly_windows.get(),
            Granularity::Daily => self.max_daily_windows.get(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CatchupHalt {
    /// Every pending window was processed.
    Completed,
    /// No source data newer than the watermark.
    NothingToDo,
    /// Stopped cleanly at the per-run cap; the next run continues.
    CapReached { cap: usize },
    /// A window failed and was rolled back; later windows were left alone.
    Failed { window: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatchupReport {
    pub granularity: Granularity,
    pub windows_processed: usize,
    pub first_window: Option<String>,
    pub last_window: Option<String>,
    pub halt: CatchupHalt,
}

impl CatchupReport {
    fn new(granularity: Granularity) -> Self {
        CatchupReport {
            granularity,
            windows_processed: 0,
            first_window: None,
            last_window: None,
            halt: CatchupHalt::Completed,
        }
    }

    fn nothing_to_do(granularity: Granularity) -> Self {
        CatchupReport {
            halt: CatchupHalt::NothingToDo,
            ..CatchupReport::new(granularity)
        }
    }

    fn record(&mut self, window: String) {
        self.windows_processed += 1;
        if self.first_window.is_none() {
            self.first_window = Some(window.clone());
        }
        self.last_window = Some(window);
    }
}

/// Hour buckets `[first, frontier)` still to process, if any.
///
/// The frontier is the hour holding the newest reading; that hour may still
/// receive readings and is never processed.
pub fn plan_hourly(
    last_processed: Option<DateTime<Utc>>,
    earliest_unconsumed: DateTime<Utc>,
    newest_reading: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let earliest_bucket = truncate_to_hour(earliest_unconsumed);
    let next = match last_processed {
        Some(last) => (last + Duration::hours(1)).max(earliest_bucket),
        None => earliest_bucket,
    };
    let frontier = truncate_to_hour(newest_reading);
    (next < frontier).then_some((next, frontier))
}

/// Last date whose 23:00 bucket is not after the newest hourly bucket.
pub fn latest_complete_day(newest_hourly_bucket: DateTime<Utc>) -> Option<NaiveDate> {
    (newest_hourly_bucket + Duration::hours(1)).date_naive().pred_opt()
}

/// Dates `[first, last]` (inclusive) still to process, if any.
pub fn plan_daily(
    last_processed: Option<NaiveDate>,
    earliest_available: NaiveDate,
    latest_complete: NaiveDate,
) -> Option<(NaiveDate, NaiveDate)> {
    let next = match last_processed {
        Some(last) => last.succ_opt()?.max(earliest_available),
        None => earliest_available,
    };
    (next <= latest_complete).then_some((next, latest_complete))
}

pub fn run_catchup<S: Storage>(
    store: &mut S,
    granularity: Granularity,
    limits: &CatchupLimits,
) -> Result<CatchupReport, AggregationError> {
    let cap = limits.for_granularity(granularity);
    let report = match granularity {
        Granularity::Hourly => run_hourly_catchup(store, cap)?,
        Granularity::Daily => run_daily_catchup(store, cap)?,
    };
    info!(
        "Catch-up {}: finished, {} window(s) processed ({:?})",
        granularity, report.windows_processed, report.halt
    );
    Ok(report)
}

fn run_hourly_catchup<S: Storage>(store: &mut S, cap: usize) -> Result<CatchupReport, AggregationError> {
    let last_processed = store.last_hourly_bucket()?;
    let Some(earliest) = store.first_unconsumed_reading()? else {
        info!("Catch-up hourly: no unconsumed readings");
        return Ok(CatchupReport::nothing_to_do(Granularity::Hourly));
    };
    let Some(newest) = store.latest_reading()? else {
        info!("Catch-up hourly: no readings");
        return Ok(CatchupReport::nothing_to_do(Granularity::Hourly));
    };
    let Some((first, frontier)) = plan_hourly(last_processed, earliest, newest) else {
        info!(
            "Catch-up hourly: nothing before frontier {} (watermark {})",
            format_ts(truncate_to_hour(newest)),
            last_processed.map(format_ts).unwrap_or_else(|| "-".to_string())
        );
        return Ok(CatchupReport::nothing_to_do(Granularity::Hourly));
    };

    info!(
        "Catch-up hourly: range [{}, {}) (~{} hour(s), cap {})",
        format_ts(first),
        format_ts(frontier),
        (frontier - first).num_hours(),
        cap
    );

    let mut report = CatchupReport::new(Granularity::Hourly);
    let mut current = first;
    while current < frontier {
        if report.windows_processed >= cap {
            warn!("Catch-up hourly: cap of {} window(s) reached at {}", cap, format_ts(current));
            report.halt = CatchupHalt::CapReached { cap };
            break;
        }
        let label = format_ts(current);
        // the processor handles the hour *before* the timestamp it is given
        if let WindowOutcome::Error { message } = process_hourly(store, current + Duration::hours(1)) {
            error!("Catch-up hourly: window {} failed, stopping", label);
            report.halt = CatchupHalt::Failed { window: label, message };
            break;
        }
        report.record(label);
        current += Duration::hours(1);
    }
    Ok(report)
}

fn run_daily_catchup<S: Storage>(store: &mut S, cap: usize) -> Result<CatchupReport, AggregationError> {
    let last_processed = store.last_daily_date()?;
    let Some((first_bucket, last_bucket)) = store.hourly_bucket_span()? else {
        info!("Catch-up daily: no hourly aggregates yet");
        return Ok(CatchupReport::nothing_to_do(Granularity::Daily));
    };
    let Some(latest_complete) = latest_complete_day(last_bucket) else {
        return Ok(CatchupReport::nothing_to_do(Granularity::Daily));
    };
    let Some((first, last)) = plan_daily(last_processed, first_bucket.date_naive(), latest_complete) else {
        info!(
            "Catch-up daily: nothing up to {} (watermark {})",
            latest_complete,
            last_processed.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
        );
        return Ok(CatchupReport::nothing_to_do(Granularity::Daily));
    };

    info!(
        "Catch-up daily: range [{}, {}] ({} day(s), cap {})",
        first,
        last,
        (last - first).num_days() + 1,
        cap
    );

    let mut report = CatchupReport::new(Granularity::Daily);
    let mut current = first;
    while current <= last {
        if report.windows_processed >= cap {
            warn!("Catch-up daily: cap of {} window(s) reached at {}", cap, current);
            report.halt = CatchupHalt::CapReached { cap };
            break;
        }
        let label = current.to_string();
        if let WindowOutcome::Error { message } = process_daily(store, current) {
            error!("Catch-up daily: day {} failed, stopping", label);
            report.halt = CatchupHalt::Failed { window: label, message };
            break;
        }
        report.record(label);
        match current.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn limits(hourly: usize, daily: usize) -> CatchupLimits {
        CatchupLimits {
            max_hourly_windows: NonZeroUsize::new(hourly).unwrap(),
            max_daily_windows: NonZeroUsize::new(daily).unwrap(),
        }
    }

    fn fill_days(store: &mut MemoryStore, site_id: i64, days: std::ops::RangeInclusive<u32>) {
        for d in days {
            for h in 0..24 {
                store.add_hourly(site_id, at(d, h, 0), 1.0, 2);
            }
        }
    }

    #[test]
    fn plan_hourly_starts_after_watermark_but_not_before_data() {
        assert_eq!(
            plan_hourly(Some(at(2, 9, 0)), at(2, 10, 5), at(2, 13, 1)),
            Some((at(2, 10, 0), at(2, 13, 0)))
        );
        assert_eq!(
            plan_hourly(Some(at(2, 3, 0)), at(2, 10, 5), at(2, 13, 1)),
            Some((at(2, 10, 0), at(2, 13, 0)))
        );
        assert_eq!(
            plan_hourly(None, at(2, 7, 59), at(2, 8, 30)),
            Some((at(2, 7, 0), at(2, 8, 0)))
        );
        assert_eq!(plan_hourly(None, at(2, 8, 5), at(2, 8, 30)), None);
        assert_eq!(plan_hourly(Some(at(2, 12, 0)), at(2, 10, 5), at(2, 13, 1)), None);
    }

    #[test]
    fn latest_complete_day_requires_the_last_hour() {
        assert_eq!(latest_complete_day(at(4, 23, 0)), Some(date(4)));
        assert_eq!(latest_complete_day(at(4, 22, 0)), Some(date(3)));
        assert_eq!(latest_complete_day(at(5, 0, 0)), Some(date(4)));
    }

    #[test]
    fn plan_daily_is_inclusive() {
        assert_eq!(plan_daily(Some(date(1)), date(1), date(4)), Some((date(2), date(4))));
        assert_eq!(plan_daily(None, date(3), date(4)), Some((date(3), date(4))));
        assert_eq!(plan_daily(Some(date(4)), date(1), date(4)), None);
        assert_eq!(plan_daily(Some(date(1)), date(3), date(3)), Some((date(3), date(3))));
    }

    #[test]
    fn nothing_to_do_without_unconsumed_readings() {
        let mut store = MemoryStore::default();
        store.add_consumed_reading(1, at(2, 10, 5), 1.0);
        let report = run_catchup(&mut store, Granularity::Hourly, &CatchupLimits::default()).unwrap();
        assert_eq!(report.windows_processed, 0);
        assert_eq!(report.halt, CatchupHalt::NothingToDo);
        assert_eq!(store.commits, 0);
    }

    #[test]
    fn hourly_catchup_stops_before_the_frontier_hour() {
        let mut store = MemoryStore::default();
        store.add_reading(1, at(2, 10, 5), 2.0);
        store.add_reading(1, at(2, 10, 40), 3.0);
        store.add_reading(2, at(2, 11, 10), 1.0);
        store.add_reading(1, at(2, 12, 30), 4.0);

        let report = run_catchup(&mut store, Granularity::Hourly, &CatchupLimits::default()).unwrap();
        assert_eq!(report.windows_processed, 2);
        assert_eq!(report.halt, CatchupHalt::Completed);
        assert_eq!(report.first_window.as_deref(), Some("2024-03-02T10:00:00Z"));
        assert_eq!(report.last_window.as_deref(), Some("2024-03-02T11:00:00Z"));

        let buckets: Vec<_> = store.hourly().iter().map(|h| h.bucket_start).collect();
        assert_eq!(buckets, vec![at(2, 10, 0), at(2, 11, 0)]);
        let frontier_reading = store.readings().iter().find(|r| r.recorded_at == at(2, 12, 30)).unwrap();
        assert!(!frontier_reading.consumed);
    }

    #[test]
    fn rerunning_catchup_adds_nothing() {
        let mut store = MemoryStore::default();
        store.add_reading(1, at(2, 10, 5), 2.0);
        store.add_reading(1, at(2, 11, 5), 2.0);
        store.add_reading(1, at(2, 12, 5), 2.0);
        run_catchup(&mut store, Granularity::Hourly, &CatchupLimits::default()).unwrap();
        let rows_after_first = store.hourly().len();

        let report = run_catchup(&mut store, Granularity::Hourly, &CatchupLimits::default()).unwrap();
        assert_eq!(report.windows_processed, 0);
        assert_eq!(report.halt, CatchupHalt::NothingToDo);
        assert_eq!(store.hourly().len(), rows_after_first);
    }

    #[test]
    fn empty_hours_inside_the_range_count_as_processed() {
        let mut store = MemoryStore::default();
        store.add_reading(1, at(2, 10, 5), 2.0);
        store.add_reading(1, at(2, 14, 20), 2.0);

        let report = run_catchup(&mut store, Granularity::Hourly, &CatchupLimits::default()).unwrap();
        assert_eq!(report.windows_processed, 4);
        assert_eq!(store.hourly().len(), 1);
    }

    #[test]
    fn hourly_catchup_halts_on_first_failure() {
        let mut store = MemoryStore::default();
        for h in 8..13 {
            store.add_reading(1, at(2, h, 15), 1.0);
        }
        store.fail_hour(at(2, 10, 0));

        let report = run_catchup(&mut store, Granularity::Hourly, &CatchupLimits::default()).unwrap();
        assert_eq!(report.windows_processed, 2);
        assert_eq!(
            report.halt,
            CatchupHalt::Failed {
                window: "2024-03-02T10:00:00Z".to_string(),
                message: "storage failure: insert hourly consumption failed: injected failure".to_string(),
            }
        );
        let buckets: Vec<_> = store.hourly().iter().map(|h| h.bucket_start).collect();
        assert_eq!(buckets, vec![at(2, 8, 0), at(2, 9, 0)]);
    }

    #[test]
    fn cap_stops_cleanly_and_next_run_resumes() {
        let mut store = MemoryStore::default();
        for h in 10..15 {
            store.add_reading(1, at(2, h, 5), 1.0);
        }

        let report = run_catchup(&mut store, Granularity::Hourly, &limits(2, 10)).unwrap();
        assert_eq!(report.windows_processed, 2);
        assert_eq!(report.halt, CatchupHalt::CapReached { cap: 2 });

        let report = run_catchup(&mut store, Granularity::Hourly, &limits(2, 10)).unwrap();
        assert_eq!(report.windows_processed, 2);
        assert_eq!(report.halt, CatchupHalt::Completed);

        let buckets: Vec<_> = store.hourly().iter().map(|h| h.bucket_start).collect();
        assert_eq!(buckets, vec![at(2, 10, 0), at(2, 11, 0), at(2, 12, 0), at(2, 13, 0)]);
    }

    #[test]
    fn daily_catchup_processes_dates_in_order() {
        let mut store = MemoryStore::default();
        store.add_daily(1, date(1), 24.0, 24);
        fill_days(&mut store, 1, 1..=4);

        let report = run_catchup(&mut store, Granularity::Daily, &CatchupLimits::default()).unwrap();
        assert_eq!(report.windows_processed, 3);
        assert_eq!(report.first_window.as_deref(), Some("2024-03-02"));
        assert_eq!(report.last_window.as_deref(), Some("2024-03-04"));
        let dates: Vec<_> = store.daily().iter().map(|d| d.bucket_date).collect();
        assert_eq!(dates, vec![date(1), date(2), date(3), date(4)]);
        assert_eq!(store.daily()[1].hours_with_data, 24);
    }

    #[test]
    fn daily_catchup_stops_at_failed_day() {
        let mut store = MemoryStore::default();
        store.add_daily(1, date(1), 24.0, 24);
        fill_days(&mut store, 1, 1..=4);
        store.fail_day(date(3));

        let report = run_catchup(&mut store, Granularity::Daily, &CatchupLimits::default()).unwrap();
        assert_eq!(report.windows_processed, 1);
        assert!(matches!(report.halt, CatchupHalt::Failed { ref window, .. } if window == "2024-03-03"));
        let dates: Vec<_> = store.daily().iter().map(|d| d.bucket_date).collect();
        assert_eq!(dates, vec![date(1), date(2)]);
    }

    #[test]
    fn daily_catchup_skips_a_partially_filled_day() {
        let mut store = MemoryStore::default();
        fill_days(&mut store, 1, 2..=2);
        for h in 0..11 {
            store.add_hourly(1, at(3, h, 0), 1.0, 2);
        }

        let report = run_catchup(&mut store, Granularity::Daily, &CatchupLimits::default()).unwrap();
        assert_eq!(report.windows_processed, 1);
        assert_eq!(store.daily().len(), 1);
        assert_eq!(store.daily()[0].bucket_date, date(2));
        assert_eq!(store.daily()[0].total_kwh, 24.0);
    }

    #[test]
    fn report_serializes_halt_reason() {
        let mut report = CatchupReport::new(Granularity::Daily);
        report.halt = CatchupHalt::CapReached { cap: 5 };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["granularity"], "daily");
        assert_eq!(json["halt"]["reason"], "cap_reached");
        assert_eq!(json["halt"]["cap"], 5);
    }
}
