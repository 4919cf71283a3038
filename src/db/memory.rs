//! In-memory storage for engine tests.
//!
//! Writes are staged on a copy of the tables and only applied on commit.
//! Unique indexes on the aggregate tables are emulated, and individual
//! windows can be made to fail.

use crate::db::models::{
    DailyConsumption, HourlyConsumption, NewDailyConsumption, NewHourlyConsumption, Reading,
};
use crate::db::store::{SiteTotals, Storage, StorageError, StorageTx};
use crate::window::{Granularity, Window};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default, Clone)]
struct Tables {
    readings: Vec<Reading>,
    hourly: Vec<HourlyConsumption>,
    daily: Vec<DailyConsumption>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    next_id: i64,
    locks: HashSet<Granularity>,
    failing_hours: HashSet<DateTime<Utc>>,
    failing_days: HashSet<NaiveDate>,
    fail_mark_consumed: bool,
    pub commits: usize,
    pub rollbacks: usize,
}

impl MemoryStore {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_reading(&mut self, site_id: i64, recorded_at: DateTime<Utc>, consumption_kwh: f64) {
        self.push_reading(site_id, recorded_at, consumption_kwh, false);
    }

    pub fn add_consumed_reading(&mut self, site_id: i64, recorded_at: DateTime<Utc>, consumption_kwh: f64) {
        self.push_reading(site_id, recorded_at, consumption_kwh, true);
    }

    fn push_reading(&mut self, site_id: i64, recorded_at: DateTime<Utc>, consumption_kwh: f64, consumed: bool) {
        let id = self.next_id();
        self.tables.readings.push(Reading {
            id,
            site_id,
            recorded_at,
            consumption_kwh,
            received_at: recorded_at,
            consumed,
        });
    }

    pub fn add_hourly(&mut self, site_id: i64, bucket_start: DateTime<Utc>, total_kwh: f64, reading_count: i64) {
        let id = self.next_id();
        self.tables.hourly.push(HourlyConsumption {
            id,
            site_id,
            bucket_start,
            total_kwh,
            reading_count,
            average_kwh: Some(total_kwh / reading_count as f64),
            processed_at: bucket_start,
        });
    }

    pub fn add_daily(&mut self, site_id: i64, bucket_date: NaiveDate, total_kwh: f64, hours_with_data: i64) {
        let id = self.next_id();
        self.tables.daily.push(DailyConsumption {
            id,
            site_id,
            bucket_date,
            total_kwh,
            hours_with_data,
            average_per_hour_kwh: total_kwh / hours_with_data as f64,
            processed_at: crate::window::day_start(bucket_date),
        });
    }

    /// Makes the hourly insert for the bucket starting at `bucket_start` fail.
    pub fn fail_hour(&mut self, bucket_start: DateTime<Utc>) {
        self.failing_hours.insert(bucket_start);
    }

    /// Makes the daily insert for `date` fail.
    pub fn fail_day(&mut self, date: NaiveDate) {
        self.failing_days.insert(date);
    }

    pub fn fail_mark_consumed(&mut self) {
        self.fail_mark_consumed = true;
    }

    /// Simulates another run holding the granularity lock.
    pub fn hold_lock(&mut self, granularity: Granularity) {
        self.locks.insert(granularity);
    }

    pub fn is_locked(&self, granularity: Granularity) -> bool {
        self.locks.contains(&granularity)
    }

    pub fn readings(&self) -> &[Reading] {
        &self.tables.readings
    }

    pub fn hourly(&self) -> &[HourlyConsumption] {
        &self.tables.hourly
    }

    pub fn daily(&self) -> &[DailyConsumption] {
        &self.tables.daily
    }
}

fn group_totals<I: Iterator<Item = (i64, f64)>>(rows: I) -> Vec<SiteTotals> {
    let mut by_site: BTreeMap<i64, (f64, i64)> = BTreeMap::new();
    for (site_id, value) in rows {
        let entry = by_site.entry(site_id).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
    by_site
        .into_iter()
        .map(|(site_id, (total_kwh, count))| SiteTotals {
            site_id,
            total_kwh,
            count,
        })
        .collect()
}

impl Storage for MemoryStore {
    type Tx<'a> = MemoryTx<'a>;

    fn begin(&mut self) -> Result<MemoryTx<'_>, StorageError> {
        let staged = self.tables.clone();
        Ok(MemoryTx {
            store: self,
            staged,
            finished: false,
        })
    }

    fn last_hourly_bucket(&mut self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.tables.hourly.iter().map(|h| h.bucket_start).max())
    }

    fn hourly_bucket_span(&mut self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StorageError> {
        let first = self.tables.hourly.iter().map(|h| h.bucket_start).min();
        let last = self.tables.hourly.iter().map(|h| h.bucket_start).max();
        Ok(first.zip(last))
    }

    fn last_daily_date(&mut self) -> Result<Option<NaiveDate>, StorageError> {
        Ok(self.tables.daily.iter().map(|d| d.bucket_date).max())
    }

    fn first_unconsumed_reading(&mut self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self
            .tables
            .readings
            .iter()
            .filter(|r| !r.consumed)
            .map(|r| r.recorded_at)
            .min())
    }

    fn latest_reading(&mut self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.tables.readings.iter().map(|r| r.recorded_at).max())
    }

    fn try_lock(&mut self, granularity: Granularity) -> Result<bool, StorageError> {
        Ok(self.locks.insert(granularity))
    }

    fn unlock(&mut self, granularity: Granularity) -> Result<(), StorageError> {
        self.locks.remove(&granularity);
        Ok(())
    }
}

pub struct MemoryTx<'a> {
    store: &'a mut MemoryStore,
    staged: Tables,
    finished: bool,
}

impl StorageTx for MemoryTx<'_> {
    fn sum_unconsumed_readings(&mut self, window: &Window) -> Result<Vec<SiteTotals>, StorageError> {
        Ok(group_totals(
            self.staged
                .readings
                .iter()
                .filter(|r| !r.consumed && window.contains(r.recorded_at))
                .map(|r| (r.site_id, r.consumption_kwh)),
        ))
    }

    fn sum_hourly(&mut self, window: &Window) -> Result<Vec<SiteTotals>, StorageError> {
        Ok(group_totals(
            self.staged
                .hourly
                .iter()
                .filter(|h| window.contains(h.bucket_start))
                .map(|h| (h.site_id, h.total_kwh)),
        ))
    }

    fn insert_hourly(&mut self, rows: &[NewHourlyConsumption]) -> Result<usize, StorageError> {
        for row in rows {
            if self.store.failing_hours.contains(&row.bucket_start) {
                return Err(StorageError::Query {
                    context: "insert hourly consumption",
                    message: "injected failure".to_string(),
                });
            }
            let taken = self
                .staged
                .hourly
                .iter()
                .any(|h| h.site_id == row.site_id && h.bucket_start == row.bucket_start);
            if taken {
                return Err(StorageError::UniqueViolation {
                    context: "insert hourly consumption",
                    message: format!("site {} bucket {}", row.site_id, row.bucket_start),
                });
            }
            let id = self.store.next_id();
            self.staged.hourly.push(HourlyConsumption {
                id,
                site_id: row.site_id,
                bucket_start: row.bucket_start,
                total_kwh: row.total_kwh,
                reading_count: row.reading_count,
                average_kwh: row.average_kwh,
                processed_at: row.processed_at,
            });
        }
        Ok(rows.len())
    }

    fn insert_daily(&mut self, rows: &[NewDailyConsumption]) -> Result<usize, StorageError> {
        for row in rows {
            if self.store.failing_days.contains(&row.bucket_date) {
                return Err(StorageError::Query {
                    context: "insert daily consumption",
                    message: "injected failure".to_string(),
                });
            }
            let taken = self
                .staged
                .daily
                .iter()
                .any(|d| d.site_id == row.site_id && d.bucket_date == row.bucket_date);
            if taken {
                return Err(StorageError::UniqueViolation {
                    context: "insert daily consumption",
                    message: format!("site {} date {}", row.site_id, row.bucket_date),
                });
            }
            let id = self.store.next_id();
            self.staged.daily.push(DailyConsumption {
                id,
                site_id: row.site_id,
                bucket_date: row.bucket_date,
                total_kwh: row.total_kwh,
                hours_with_data: row.hours_with_data,
                average_per_hour_kwh: row.average_per_hour_kwh,
                processed_at: row.processed_at,
            });
        }
        Ok(rows.len())
    }

    fn mark_consumed(&mut self, window: &Window) -> Result<usize, StorageError> {
        if self.store.fail_mark_consumed {
            return Err(StorageError::Query {
                context: "mark readings consumed",
                message: "injected failure".to_string(),
            });
        }
        let mut marked = 0;
        for r in self.staged.readings.iter_mut() {
            if !r.consumed && window.contains(r.recorded_at) {
                r.consumed = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.store.tables = std::mem::take(&mut self.staged);
        self.store.commits += 1;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.store.rollbacks += 1;
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.rollbacks += 1;
        }
    }
}
