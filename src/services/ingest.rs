//! Reading ingestion: parses a batch, registers unknown sites and stores the
//! readings as unconsumed, all in one transaction.

use crate::db::models::{NewReading, NewSite};
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::path::Path;

// Postgres caps a statement at 65535 bind parameters.
const INSERT_CHUNK: usize = 5_000;

/// One reading as sent by a producer. The producer's original field names
/// are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IncomingReading {
    #[serde(alias = "ID_Sensor")]
    pub site_id: i64,
    #[serde(alias = "Nombre_Sede")]
    pub site_name: Option<String>,
    #[serde(alias = "ID_Localidad")]
    pub locality: String,
    #[serde(alias = "TimestampUTC")]
    pub recorded_at: DateTime<Utc>,
    #[serde(alias = "Consumo_kWh")]
    pub consumption_kwh: f64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl IncomingReading {
    fn to_new_reading(&self) -> NewReading {
        NewReading {
            site_id: self.site_id,
            recorded_at: self.recorded_at,
            consumption_kwh: self.consumption_kwh,
            consumed: false,
        }
    }

    fn to_new_site(&self) -> NewSite {
        NewSite {
            id: self.site_id,
            name: self.site_name.clone(),
            locality: self.locality.clone(),
            lat: self.lat,
            lon: self.lon,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub received: usize,
    pub sites_created: usize,
    pub readings_inserted: usize,
}

#[derive(Debug)]
pub enum IngestError {
    Io(String),
    Parse { path: String, message: String },
    Invalid { index: usize, message: String },
    Storage(String),
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Io(e) => write!(f, "read failed: {}", e),
            IngestError::Parse { path, message } => write!(f, "invalid payload at {}: {}", path, message),
            IngestError::Invalid { index, message } => write!(f, "reading #{} rejected: {}", index, message),
            IngestError::Storage(e) => write!(f, "storing readings failed: {}", e),
        }
    }
}

impl Error for IngestError {}

impl From<diesel::result::Error> for IngestError {
    fn from(value: diesel::result::Error) -> Self {
        IngestError::Storage(value.to_string())
    }
}

pub fn load_batch(path: &Path) -> Result<Vec<IncomingReading>, IngestError> {
    let body = std::fs::read_to_string(path).map_err(|e| IngestError::Io(format!("{}: {}", path.display(), e)))?;
    parse_batch(&body)
}

/// Parses a JSON array of readings and rejects the whole batch if any reading
/// is invalid.
pub fn parse_batch(json: &str) -> Result<Vec<IncomingReading>, IngestError> {
    let de = &mut serde_json::Deserializer::from_str(json);
    let readings: Vec<IncomingReading> = serde_path_to_error::deserialize(de).map_err(|e| IngestError::Parse {
        path: e.path().to_string(),
        message: e.inner().to_string(),
    })?;
    for (index, reading) in readings.iter().enumerate() {
        validate(reading).map_err(|message| IngestError::Invalid { index, message })?;
    }
    Ok(readings)
}

fn validate(reading: &IncomingReading) -> Result<(), String> {
    if !reading.consumption_kwh.is_finite() {
        return Err(format!("consumption_kwh must be finite, got {}", reading.consumption_kwh));
    }
    if reading.consumption_kwh < 0.0 {
        return Err(format!("consumption_kwh must be >= 0, got {}", reading.consumption_kwh));
    }
    if reading.locality.trim().is_empty() {
        return Err("locality must not be empty".to_string());
    }
    Ok(())
}

/// Sites mentioned by the batch but not in `existing`, described by the first
/// reading that mentions each of them.
pub fn new_sites_for(readings: &[IncomingReading], existing: &HashSet<i64>) -> Vec<NewSite> {
    let mut seen = HashSet::new();
    readings
        .iter()
        .filter(|r| !existing.contains(&r.site_id) && seen.insert(r.site_id))
        .map(IncomingReading::to_new_site)
        .collect()
}

pub fn ingest_readings(conn: &mut PgConnection, readings: &[IncomingReading]) -> Result<IngestSummary, IngestError> {
    if readings.is_empty() {
        return Ok(IngestSummary::default());
    }

    use schema::readings::dsl as R;
    use schema::sites::dsl as S;

    let summary = conn.transaction::<_, IngestError, _>(|conn| {
        let mut site_ids: Vec<i64> = readings.iter().map(|r| r.site_id).collect();
        site_ids.sort_unstable();
        site_ids.dedup();

        let existing: HashSet<i64> = S::sites
            .filter(S::id.eq_any(&site_ids))
            .select(S::id)
            .load::<i64>(conn)?
            .into_iter()
            .collect();

        let new_sites = new_sites_for(readings, &existing);
        let mut sites_created = 0;
        for chunk in new_sites.chunks(INSERT_CHUNK) {
            // a concurrent ingest may register the same site first
            sites_created += diesel::insert_into(S::sites)
                .values(chunk)
                .on_conflict(S::id)
                .do_nothing()
                .execute(conn)?;
        }
        debug!("Registered {} new site(s) of {} referenced", sites_created, site_ids.len());

        let rows: Vec<NewReading> = readings.iter().map(IncomingReading::to_new_reading).collect();
        let mut readings_inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            readings_inserted += diesel::insert_into(R::readings).values(chunk).execute(conn)?;
        }

        Ok(IngestSummary {
            received: readings.len(),
            sites_created,
            readings_inserted,
        })
    })?;

    info!(
        "Ingested {} reading(s), {} new site(s)",
        summary.readings_inserted, summary.sites_created
    );
    Ok(summary)
}
