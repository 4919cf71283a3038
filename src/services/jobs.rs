//! Trigger surface: one job = one processor or catch-up call under the
//! granularity's lock.

use crate::db::store::Storage;
use crate::services::aggregator::AggregationError;
use crate::services::catchup::{run_catchup, CatchupHalt, CatchupLimits, CatchupReport};
use crate::services::processor::{hourly_window_for, process_daily, process_hourly, WindowOutcome};
use crate::window::Granularity;
use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// The complete hour preceding `now`.
    Hourly { now: DateTime<Utc> },
    Daily { date: NaiveDate },
    Catchup(Granularity),
}

impl Job {
    pub fn granularity(&self) -> Granularity {
        match self {
            Job::Hourly { .. } => Granularity::Hourly,
            Job::Daily { .. } => Granularity::Daily,
            Job::Catchup(g) => *g,
        }
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Job::Hourly { now } => write!(f, "hourly {}", hourly_window_for(*now)),
            Job::Daily { date } => write!(f, "daily {}", date),
            Job::Catchup(g) => write!(f, "{} catch-up", g),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobReport {
    Window {
        job: String,
        granularity: Granularity,
        outcome: WindowOutcome,
    },
    Catchup(CatchupReport),
    /// Another run held the granularity lock; nothing was touched.
    Skipped { job: String, granularity: Granularity },
}

impl JobReport {
    pub fn is_failure(&self) -> bool {
        match self {
            JobReport::Window { outcome, .. } => !outcome.is_success(),
            JobReport::Catchup(report) => matches!(report.halt, CatchupHalt::Failed { .. }),
            JobReport::Skipped { .. } => false,
        }
    }
}

pub fn run_job<S: Storage>(store: &mut S, job: Job, limits: &CatchupLimits) -> Result<JobReport, AggregationError> {
    let granularity = job.granularity();
    if !store.try_lock(granularity)? {
        warn!("{}: {} lock is held by another run, skipping", job, granularity);
        return Ok(JobReport::Skipped {
            job: job.to_string(),
            granularity,
        });
    }

    info!("{}: started", job);
    let result = match job {
        Job::Hourly { now } => Ok(JobReport::Window {
            job: job.to_string(),
            granularity,
            outcome: process_hourly(store, now),
        }),
        Job::Daily { date } => Ok(JobReport::Window {
            job: job.to_string(),
            granularity,
            outcome: process_daily(store, date),
        }),
        Job::Catchup(g) => run_catchup(store, g, limits).map(JobReport::Catchup),
    };

    if let Err(e) = store.unlock(granularity) {
        warn!("{}: releasing {} lock failed: {}", job, granularity, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn held_lock_skips_without_touching_data() {
        let mut store = MemoryStore::default();
        store.add_reading(1, at(2, 10, 5), 2.0);
        store.hold_lock(Granularity::Hourly);

        let report = run_job(&mut store, Job::Hourly { now: at(2, 11, 5) }, &CatchupLimits::default()).unwrap();
        assert_eq!(
            report,
            JobReport::Skipped {
                job: "hourly [2024-03-02T10:00:00Z, 2024-03-02T11:00:00Z)".to_string(),
                granularity: Granularity::Hourly,
            }
        );
        assert!(store.hourly().is_empty());
        assert!(store.is_locked(Granularity::Hourly));
    }

    #[test]
    fn locks_are_per_granularity() {
        let mut store = MemoryStore::default();
        store.add_hourly(1, at(2, 10, 0), 3.0, 1);
        store.hold_lock(Granularity::Hourly);

        let date = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let report = run_job(&mut store, Job::Daily { date }, &CatchupLimits::default()).unwrap();
        assert!(matches!(report, JobReport::Window { .. }));
        assert_eq!(store.daily().len(), 1);
    }

    #[test]
    fn lock_is_released_after_a_failed_window() {
        let mut store = MemoryStore::default();
        store.add_reading(1, at(2, 10, 5), 2.0);
        store.fail_mark_consumed();

        let report = run_job(&mut store, Job::Hourly { now: at(2, 11, 0) }, &CatchupLimits::default()).unwrap();
        assert!(report.is_failure());
        assert!(!store.is_locked(Granularity::Hourly));
    }

    #[test]
    fn catchup_job_wraps_the_report() {
        let mut store = MemoryStore::default();
        store.add_reading(1, at(2, 10, 5), 2.0);
        store.add_reading(1, at(2, 11, 5), 2.0);

        let report = run_job(&mut store, Job::Catchup(Granularity::Hourly), &CatchupLimits::default()).unwrap();
        match report {
            JobReport::Catchup(inner) => {
                assert_eq!(inner.windows_processed, 1);
                assert_eq!(inner.halt, CatchupHalt::Completed);
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert!(!store.is_locked(Granularity::Hourly));
    }

    #[test]
    fn window_report_serializes_kind_and_status() {
        let report = JobReport::Window {
            job: "daily 2024-03-02".to_string(),
            granularity: Granularity::Daily,
            outcome: WindowOutcome::NoData { rows_marked: 0 },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "window");
        assert_eq!(json["granularity"], "daily");
        assert_eq!(json["outcome"]["status"], "no_data");
        assert!(!report.is_failure());
    }
}
