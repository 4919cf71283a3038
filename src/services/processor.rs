//! Single-window processing: aggregate, persist, consume, then commit or roll back.
//!
//! The processor never retries and never lets an error escape; every failure
//! is rolled back and reported as `WindowOutcome::Error` so the caller can
//! decide whether to stop a longer run.

use crate::db::store::{Storage, StorageTx};
use crate::services::aggregator::{aggregate_daily, aggregate_hourly, AggregationError};
use crate::services::writer::{mark_consumed, write_daily, write_hourly};
use crate::window::{truncate_to_hour, Window};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{error, info, warn};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WindowOutcome {
    Success {
        aggregates_written: usize,
        rows_marked: usize,
    },
    /// Nothing to aggregate. A success state, not an alert.
    NoData { rows_marked: usize },
    Error { message: String },
}

impl WindowOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, WindowOutcome::Error { .. })
    }
}

/// The complete hour before the hour containing `now`.
pub fn hourly_window_for(now: DateTime<Utc>) -> Window {
    Window::hour(truncate_to_hour(now) - Duration::hours(1))
}

pub fn process_hourly<S: Storage>(store: &mut S, now: DateTime<Utc>) -> WindowOutcome {
    let window = hourly_window_for(now);
    info!("Hourly: processing {}", window);
    let label = format!("hourly {}", window);
    match store.begin() {
        Ok(mut tx) => {
            let result = run_hourly(&mut tx, &window, Utc::now());
            finish(tx, &label, result)
        }
        Err(e) => begin_failed(&label, e.into()),
    }
}

pub fn process_daily<S: Storage>(store: &mut S, date: NaiveDate) -> WindowOutcome {
    info!("Daily: processing {}", date);
    let label = format!("daily {}", date);
    match store.begin() {
        Ok(mut tx) => {
            let result = run_daily(&mut tx, date, Utc::now());
            finish(tx, &label, result)
        }
        Err(e) => begin_failed(&label, e.into()),
    }
}

fn run_hourly<T: StorageTx>(
    tx: &mut T,
    window: &Window,
    processed_at: DateTime<Utc>,
) -> Result<WindowOutcome, AggregationError> {
    let rows = aggregate_hourly(tx, window, processed_at)?;
    if rows.is_empty() {
        // sweep anything left in the window even without aggregates
        let rows_marked = mark_consumed(tx, window)?;
        return Ok(WindowOutcome::NoData { rows_marked });
    }
    let aggregates_written = write_hourly(tx, &rows)?;
    let rows_marked = mark_consumed(tx, window)?;
    Ok(WindowOutcome::Success {
        aggregates_written,
        rows_marked,
    })
}

fn run_daily<T: StorageTx>(
    tx: &mut T,
    date: NaiveDate,
    processed_at: DateTime<Utc>,
) -> Result<WindowOutcome, AggregationError> {
    let rows = aggregate_daily(tx, date, processed_at)?;
    if rows.is_empty() {
        return Ok(WindowOutcome::NoData { rows_marked: 0 });
    }
    let aggregates_written = write_daily(tx, &rows)?;
    Ok(WindowOutcome::Success {
        aggregates_written,
        rows_marked: 0,
    })
}

fn finish<T: StorageTx>(tx: T, label: &str, result: Result<WindowOutcome, AggregationError>) -> WindowOutcome {
    match result {
        Ok(outcome) => match tx.commit() {
            Ok(()) => {
                match &outcome {
                    WindowOutcome::Success {
                        aggregates_written,
                        rows_marked,
                    } => info!(
                        "{}: committed ({} aggregate(s), {} reading(s) marked)",
                        label, aggregates_written, rows_marked
                    ),
                    WindowOutcome::NoData { rows_marked } => {
                        info!("{}: no data to aggregate ({} reading(s) marked)", label, rows_marked)
                    }
                    WindowOutcome::Error { .. } => {}
                }
                outcome
            }
            Err(e) => {
                error!("{}: commit failed: {}", label, e);
                WindowOutcome::Error {
                    message: AggregationError::from(e).to_string(),
                }
            }
        },
        Err(e) => {
            error!("{}: {}; rolling back", label, e);
            if let Err(rb) = tx.rollback() {
                warn!("{}: rollback failed: {}", label, rb);
            }
            WindowOutcome::Error { message: e.to_string() }
        }
    }
}

fn begin_failed(label: &str, e: AggregationError) -> WindowOutcome {
    error!("{}: could not open transaction: {}", label, e);
    WindowOutcome::Error { message: e.to_string() }
}
