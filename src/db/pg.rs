//! Postgres implementation of the storage seam on top of diesel.

use crate::db::models::{NewDailyConsumption, NewHourlyConsumption};
use crate::db::store::{SiteTotals, Storage, StorageError, StorageTx};
use crate::schema;
use crate::window::{Granularity, Window};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::connection::{AnsiTransactionManager, TransactionManager};
use diesel::dsl::{count, max, min, sum};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Bool};
use diesel::PgConnection;
use log::{debug, warn};

type PgTransactions = AnsiTransactionManager;

#[derive(QueryableByName)]
struct LockResult {
    #[diesel(sql_type = Bool)]
    locked: bool,
}

fn query_error(context: &'static str) -> impl Fn(DieselError) -> StorageError {
    move |e| match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => StorageError::UniqueViolation {
            context,
            message: info.message().to_string(),
        },
        other => StorageError::Query {
            context,
            message: other.to_string(),
        },
    }
}

fn into_totals(rows: Vec<(i64, Option<f64>, i64)>) -> Vec<SiteTotals> {
    rows.into_iter()
        .map(|(site_id, total, count)| SiteTotals {
            site_id,
            total_kwh: total.unwrap_or(0.0),
            count,
        })
        .collect()
}

pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub fn connect(database_url: &str) -> Result<Self, StorageError> {
        PgConnection::establish(database_url)
            .map(|conn| PgStore { conn })
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

impl Storage for PgStore {
    type Tx<'a> = PgTx<'a>;

    fn begin(&mut self) -> Result<PgTx<'_>, StorageError> {
        <PgTransactions as TransactionManager<PgConnection>>::begin_transaction(&mut self.conn)
            .map_err(query_error("begin transaction"))?;
        Ok(PgTx {
            conn: &mut self.conn,
            finished: false,
        })
    }

    fn last_hourly_bucket(&mut self) -> Result<Option<DateTime<Utc>>, StorageError> {
        use schema::hourly_consumption::dsl as H;
        H::hourly_consumption
            .select(max(H::bucket_start))
            .first(&mut self.conn)
            .map_err(query_error("query last hourly bucket"))
    }

    fn hourly_bucket_span(&mut self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StorageError> {
        use schema::hourly_consumption::dsl as H;
        let (first, last): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = H::hourly_consumption
            .select((min(H::bucket_start), max(H::bucket_start)))
            .first(&mut self.conn)
            .map_err(query_error("query hourly bucket span"))?;
        Ok(first.zip(last))
    }

    fn last_daily_date(&mut self) -> Result<Option<NaiveDate>, StorageError> {
        use schema::daily_consumption::dsl as D;
        D::daily_consumption
            .select(max(D::bucket_date))
            .first(&mut self.conn)
            .map_err(query_error("query last daily date"))
    }

    fn first_unconsumed_reading(&mut self) -> Result<Option<DateTime<Utc>>, StorageError> {
        use schema::readings::dsl as R;
        R::readings
            .filter(R::consumed.eq(false))
            .select(min(R::recorded_at))
            .first(&mut self.conn)
            .map_err(query_error("query first unconsumed reading"))
    }

    fn latest_reading(&mut self) -> Result<Option<DateTime<Utc>>, StorageError> {
        use schema::readings::dsl as R;
        R::readings
            .select(max(R::recorded_at))
            .first(&mut self.conn)
            .map_err(query_error("query latest reading"))
    }

    fn try_lock(&mut self, granularity: Granularity) -> Result<bool, StorageError> {
        let result: LockResult = diesel::sql_query("SELECT pg_try_advisory_lock($1) AS locked")
            .bind::<BigInt, _>(granularity.lock_key())
            .get_result(&mut self.conn)
            .map_err(|e| StorageError::Lock(format!("acquire {} lock: {}", granularity, e)))?;
        debug!("Advisory lock for {} acquired={}", granularity, result.locked);
        Ok(result.locked)
    }

    fn unlock(&mut self, granularity: Granularity) -> Result<(), StorageError> {
        let result: LockResult = diesel::sql_query("SELECT pg_advisory_unlock($1) AS locked")
            .bind::<BigInt, _>(granularity.lock_key())
            .get_result(&mut self.conn)
            .map_err(|e| StorageError::Lock(format!("release {} lock: {}", granularity, e)))?;
        if !result.locked {
            warn!("Advisory lock for {} was not held by this session", granularity);
        }
        Ok(())
    }
}

pub struct PgTx<'a> {
    conn: &'a mut PgConnection,
    finished: bool,
}

impl StorageTx for PgTx<'_> {
    fn sum_unconsumed_readings(&mut self, window: &Window) -> Result<Vec<SiteTotals>, StorageError> {
        use schema::readings::dsl as R;
        let rows: Vec<(i64, Option<f64>, i64)> = R::readings
            .filter(
                R::recorded_at
                    .ge(window.start)
                    .and(R::recorded_at.lt(window.end))
                    .and(R::consumed.eq(false)),
            )
            .group_by(R::site_id)
            .select((R::site_id, sum(R::consumption_kwh), count(R::id)))
            .order(R::site_id.asc())
            .load(&mut *self.conn)
            .map_err(query_error("aggregate readings"))?;
        Ok(into_totals(rows))
    }

    fn sum_hourly(&mut self, window: &Window) -> Result<Vec<SiteTotals>, StorageError> {
        use schema::hourly_consumption::dsl as H;
        let rows: Vec<(i64, Option<f64>, i64)> = H::hourly_consumption
            .filter(H::bucket_start.ge(window.start).and(H::bucket_start.lt(window.end)))
            .group_by(H::site_id)
            .select((H::site_id, sum(H::total_kwh), count(H::id)))
            .order(H::site_id.asc())
            .load(&mut *self.conn)
            .map_err(query_error("aggregate hourly consumption"))?;
        Ok(into_totals(rows))
    }

    fn insert_hourly(&mut self, rows: &[NewHourlyConsumption]) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        use schema::hourly_consumption::dsl as H;
        diesel::insert_into(H::hourly_consumption)
            .values(rows)
            .execute(&mut *self.conn)
            .map_err(query_error("insert hourly consumption"))
    }

    fn insert_daily(&mut self, rows: &[NewDailyConsumption]) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        use schema::daily_consumption::dsl as D;
        diesel::insert_into(D::daily_consumption)
            .values(rows)
            .execute(&mut *self.conn)
            .map_err(query_error("insert daily consumption"))
    }

    fn mark_consumed(&mut self, window: &Window) -> Result<usize, StorageError> {
        use schema::readings::dsl as R;
        diesel::update(
            R::readings.filter(
                R::recorded_at
                    .ge(window.start)
                    .and(R::recorded_at.lt(window.end))
                    .and(R::consumed.eq(false)),
            ),
        )
        .set(R::consumed.eq(true))
        .execute(&mut *self.conn)
        .map_err(query_error("mark readings consumed"))
    }

    fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        <PgTransactions as TransactionManager<PgConnection>>::commit_transaction(&mut *self.conn)
            .map_err(query_error("commit"))
    }

    fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        <PgTransactions as TransactionManager<PgConnection>>::rollback_transaction(&mut *self.conn)
            .map_err(query_error("rollback"))
    }
}

impl Drop for PgTx<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = <PgTransactions as TransactionManager<PgConnection>>::rollback_transaction(&mut *self.conn) {
            warn!("Rolling back abandoned transaction failed: {}", e);
        }
    }
}
