//! Transactional storage seam used by the aggregation engine.
//!
//! A `Storage` hands out explicit transaction values; everything that reads
//! or writes one window goes through that value and only the caller decides
//! whether it is committed or rolled back. Dropping an unfinished
//! transaction rolls it back.

use crate::db::models::{NewDailyConsumption, NewHourlyConsumption};
use crate::window::{Granularity, Window};
use chrono::{DateTime, NaiveDate, Utc};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Could not open or keep a connection.
    Connection(String),
    /// A statement failed; `context` names the step.
    Query { context: &'static str, message: String },
    /// A unique index rejected an aggregate row.
    UniqueViolation { context: &'static str, message: String },
    /// Acquiring or releasing a granularity lock failed.
    Lock(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Connection(e) => write!(f, "connection error: {}", e),
            StorageError::Query { context, message } => write!(f, "{} failed: {}", context, message),
            StorageError::UniqueViolation { context, message } => {
                write!(f, "{} rejected duplicate row: {}", context, message)
            }
            StorageError::Lock(e) => write!(f, "lock error: {}", e),
        }
    }
}

impl Error for StorageError {}

/// Per-site totals of one window, as grouped by the storage layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteTotals {
    pub site_id: i64,
    pub total_kwh: f64,
    pub count: i64,
}

pub trait Storage {
    type Tx<'a>: StorageTx
    where
        Self: 'a;

    fn begin(&mut self) -> Result<Self::Tx<'_>, StorageError>;

    /// max(bucket_start) over hourly aggregates.
    fn last_hourly_bucket(&mut self) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// (min, max) of bucket_start over hourly aggregates.
    fn hourly_bucket_span(&mut self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StorageError>;

    /// max(bucket_date) over daily aggregates.
    fn last_daily_date(&mut self) -> Result<Option<NaiveDate>, StorageError>;

    /// Oldest timestamp among readings still waiting to be consumed.
    fn first_unconsumed_reading(&mut self) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Newest reading timestamp regardless of its consumed flag.
    fn latest_reading(&mut self) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Non-blocking; `Ok(false)` when another run holds the lock.
    fn try_lock(&mut self, granularity: Granularity) -> Result<bool, StorageError>;

    fn unlock(&mut self, granularity: Granularity) -> Result<(), StorageError>;
}

pub trait StorageTx {
    /// Unconsumed readings with `recorded_at` in the window, grouped by site.
    fn sum_unconsumed_readings(&mut self, window: &Window) -> Result<Vec<SiteTotals>, StorageError>;

    /// Hourly aggregates with `bucket_start` in the window, grouped by site.
    fn sum_hourly(&mut self, window: &Window) -> Result<Vec<SiteTotals>, StorageError>;

    fn insert_hourly(&mut self, rows: &[NewHourlyConsumption]) -> Result<usize, StorageError>;

    fn insert_daily(&mut self, rows: &[NewDailyConsumption]) -> Result<usize, StorageError>;

    /// Flips `consumed` for still-unconsumed readings in the window.
    fn mark_consumed(&mut self, window: &Window) -> Result<usize, StorageError>;

    fn commit(self) -> Result<(), StorageError>
    where
        Self: Sized;

    fn rollback(self) -> Result<(), StorageError>
    where
        Self: Sized;
}
