//! Diesel model structs for the site directory, raw readings and the two
//! aggregate layers.
//!
//! Important: `hourly_consumption` and `daily_consumption` carry unique
//! indexes on `(site_id, bucket)`; inserts are plain inserts so a repeated
//! window surfaces as a unique violation instead of a silent duplicate.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::sites)]
pub struct Site {
    pub id: i64,
    pub name: Option<String>,
    pub locality: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::sites)]
pub struct NewSite {
    pub id: i64,
    pub name: Option<String>,
    pub locality: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::readings)]
#[diesel(belongs_to(Site))]
pub struct Reading {
    pub id: i64,
    pub site_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub consumption_kwh: f64,
    pub received_at: DateTime<Utc>,
    pub consumed: bool,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::readings)]
pub struct NewReading {
    pub site_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub consumption_kwh: f64,
    pub consumed: bool,
}

// One row per (site, hour); bucket_start is truncated to the hour.
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::hourly_consumption)]
#[diesel(belongs_to(Site))]
pub struct HourlyConsumption {
    pub id: i64,
    pub site_id: i64,
    pub bucket_start: DateTime<Utc>,
    pub total_kwh: f64,
    pub reading_count: i64,
    pub average_kwh: Option<f64>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::hourly_consumption)]
pub struct NewHourlyConsumption {
    pub site_id: i64,
    pub bucket_start: DateTime<Utc>,
    pub total_kwh: f64,
    pub reading_count: i64,
    pub average_kwh: Option<f64>,
    pub processed_at: DateTime<Utc>,
}

// One row per (site, UTC date), folded from hourly rows.
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::daily_consumption)]
#[diesel(belongs_to(Site))]
pub struct DailyConsumption {
    pub id: i64,
    pub site_id: i64,
    pub bucket_date: NaiveDate,
    pub total_kwh: f64,
    pub hours_with_data: i64,
    pub average_per_hour_kwh: f64,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::daily_consumption)]
pub struct NewDailyConsumption {
    pub site_id: i64,
    pub bucket_date: NaiveDate,
    pub total_kwh: f64,
    pub hours_with_data: i64,
    pub average_per_hour_kwh: f64,
    pub processed_at: DateTime<Utc>,
}
