//! Persists aggregate rows and consumes raw readings inside the caller's
//! transaction. Nothing here commits or rolls back.

use crate::db::models::{NewDailyConsumption, NewHourlyConsumption};
use crate::db::store::{StorageError, StorageTx};
use crate::window::Window;
use log::debug;

/// Appends the rows as-is; a window already present is rejected by the
/// unique index, never merged.
pub fn write_hourly<T: StorageTx>(tx: &mut T, rows: &[NewHourlyConsumption]) -> Result<usize, StorageError> {
    let written = tx.insert_hourly(rows)?;
    debug!("Prepared {} hourly aggregate row(s)", written);
    Ok(written)
}

pub fn write_daily<T: StorageTx>(tx: &mut T, rows: &[NewDailyConsumption]) -> Result<usize, StorageError> {
    let written = tx.insert_daily(rows)?;
    debug!("Prepared {} daily aggregate row(s)", written);
    Ok(written)
}

/// Flags every still-unconsumed reading in the window. Idempotent: a second
/// call over the same window marks nothing.
pub fn mark_consumed<T: StorageTx>(tx: &mut T, window: &Window) -> Result<usize, StorageError> {
    let marked = tx.mark_consumed(window)?;
    debug!("Prepared {} reading(s) in {} to be marked consumed", marked, window);
    Ok(marked)
}
