//! Periodic triggers: one thread per granularity, each opening its own
//! connection per run.

use crate::config::Config;
use crate::db::pg::PgStore;
use crate::services::catchup::CatchupLimits;
use crate::services::jobs::{run_job, Job};
use crate::window::{day_start, format_ts, truncate_to_hour, Granularity};
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use std::thread;

/// First `HH:minute` strictly after `now`.
pub fn next_hourly_run(now: DateTime<Utc>, minute: u32) -> DateTime<Utc> {
    let candidate = truncate_to_hour(now) + Duration::minutes(i64::from(minute));
    if candidate > now {
        candidate
    } else {
        candidate + Duration::hours(1)
    }
}

/// First `hour:minute` UTC strictly after `now`.
pub fn next_daily_run(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let candidate =
        day_start(now.date_naive()) + Duration::hours(i64::from(hour)) + Duration::minutes(i64::from(minute));
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

/// The daily job fired at `fired_at` processes the previous UTC day.
fn daily_job_for(fired_at: DateTime<Utc>) -> Job {
    let today = fired_at.date_naive();
    Job::Daily {
        date: today.pred_opt().unwrap_or(today),
    }
}

pub fn run(cfg: &Config) -> Result<(), String> {
    let limits = cfg.catchup_limits();

    if cfg.catchup_on_start {
        info!("Running catch-up before starting the scheduler");
        for granularity in [Granularity::Hourly, Granularity::Daily] {
            run_once(&cfg.database_url, Job::Catchup(granularity), &limits);
        }
    } else {
        info!("Catch-up on start disabled via CATCHUP_ON_START={}", cfg.catchup_on_start);
    }

    let mut handles = Vec::new();

    if cfg.hourly_job_enabled {
        let url = cfg.database_url.clone();
        let minute = cfg.hourly_job_minute;
        info!("Scheduling hourly job at minute {} of every hour", minute);
        let handle = thread::Builder::new()
            .name("hourly-job".to_string())
            .spawn(move || {
                periodic_loop(
                    Granularity::Hourly,
                    &url,
                    &limits,
                    |now| next_hourly_run(now, minute),
                    |fired_at| Job::Hourly { now: fired_at },
                )
            })
            .map_err(|e| format!("spawning hourly job thread failed: {}", e))?;
        handles.push(handle);
    } else {
        info!("Hourly job disabled via HOURLY_JOB_ENABLED={}", cfg.hourly_job_enabled);
    }

    if cfg.daily_job_enabled {
        let url = cfg.database_url.clone();
        let (hour, minute) = (cfg.daily_job_hour, cfg.daily_job_minute);
        info!("Scheduling daily job at {:02}:{:02} UTC", hour, minute);
        let handle = thread::Builder::new()
            .name("daily-job".to_string())
            .spawn(move || {
                periodic_loop(
                    Granularity::Daily,
                    &url,
                    &limits,
                    |now| next_daily_run(now, hour, minute),
                    daily_job_for,
                )
            })
            .map_err(|e| format!("spawning daily job thread failed: {}", e))?;
        handles.push(handle);
    } else {
        info!("Daily job disabled via DAILY_JOB_ENABLED={}", cfg.daily_job_enabled);
    }

    if handles.is_empty() {
        warn!("No periodic jobs enabled; scheduler has nothing to do");
        return Ok(());
    }

    for handle in handles {
        handle
            .join()
            .map_err(|_| "scheduler thread terminated unexpectedly".to_string())?;
    }
    Ok(())
}

fn periodic_loop<N, J>(granularity: Granularity, database_url: &str, limits: &CatchupLimits, next_fire: N, job_for: J)
where
    N: Fn(DateTime<Utc>) -> DateTime<Utc>,
    J: Fn(DateTime<Utc>) -> Job,
{
    loop {
        let fire_at = next_fire(Utc::now());
        info!("{} job: next run at {}", granularity, format_ts(fire_at));

        // to_std fails once the fire time has passed
        let wait = (fire_at - Utc::now()).to_std().unwrap_or_default();
        thread::sleep(wait);

        run_once(database_url, job_for(fire_at), limits);
    }
}

/// Runs one job on a fresh connection; failures are logged, never propagated.
fn run_once(database_url: &str, job: Job, limits: &CatchupLimits) {
    let mut store = match PgStore::connect(database_url) {
        Ok(store) => store,
        Err(e) => {
            error!("{}: {}", job, e);
            return;
        }
    };
    match run_job(&mut store, job, limits) {
        Ok(report) => {
            let json = serde_json::to_string(&report).unwrap_or_else(|e| format!("<unserializable report: {}>", e));
            if report.is_failure() {
                error!("{}: {}", job, json);
            } else {
                info!("{}: {}", job, json);
            }
        }
        Err(e) => error!("{}: aborted: {}", job, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, s).unwrap()
    }

    #[test]
    fn hourly_fires_at_the_configured_minute() {
        assert_eq!(next_hourly_run(at(2, 10, 0, 0), 5), at(2, 10, 5, 0));
        assert_eq!(next_hourly_run(at(2, 10, 4, 59), 5), at(2, 10, 5, 0));
        assert_eq!(next_hourly_run(at(2, 10, 5, 0), 5), at(2, 11, 5, 0));
        assert_eq!(next_hourly_run(at(2, 23, 30, 0), 5), at(3, 0, 5, 0));
    }

    #[test]
    fn daily_fires_once_per_day() {
        assert_eq!(next_daily_run(at(2, 0, 0, 0), 0, 15), at(2, 0, 15, 0));
        assert_eq!(next_daily_run(at(2, 0, 15, 0), 0, 15), at(3, 0, 15, 0));
        assert_eq!(next_daily_run(at(2, 18, 0, 0), 0, 15), at(3, 0, 15, 0));
        assert_eq!(next_daily_run(at(31, 23, 0, 0), 23, 30), at(31, 23, 30, 0));
    }

    #[test]
    fn daily_job_targets_the_previous_day() {
        assert_eq!(
            daily_job_for(at(1, 0, 15, 0)),
            Job::Daily {
                date: NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
            }
        );
    }
}
