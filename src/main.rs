pub mod config;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod pg;
    pub mod store;
}
pub mod dotenv;
pub mod schema;
pub mod services {
    pub mod aggregator;
    pub mod catchup;
    pub mod ingest;
    pub mod jobs;
    pub mod processor;
    pub mod scheduler;
    pub mod writer;
}
pub mod window;

use crate::config::Config;
use crate::db::pg::PgStore;
use crate::services::jobs::{run_job, Job};
use crate::services::{ingest, scheduler};
use crate::window::Granularity;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info};
use serde::Serialize;
use std::path::PathBuf;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const USAGE: &str = "usage: energy-rollup [--env-file PATH] \
[serve | hourly [--at RFC3339] | catchup | daily [--date YYYY-MM-DD] | daily-catchup | ingest FILE | migrate]";

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Serve,
    Hourly { at: Option<DateTime<Utc>> },
    Catchup,
    Daily { date: Option<NaiveDate> },
    DailyCatchup,
    Ingest { file: PathBuf },
    Migrate,
}

#[derive(Debug, PartialEq)]
struct Cli {
    mode: Mode,
    env_file: Option<PathBuf>,
}

#[derive(Serialize)]
struct MigrationReport {
    kind: &'static str,
    applied: Vec<String>,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<Vec<String>, String> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| format!("Applying database migrations failed: {}", e))?;
    let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>();
    if names.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        info!("Applied {} database migration(s): {}", names.len(), names.join(", "));
    }
    Ok(names)
}

/// Prints one JSON line on stdout.
fn emit<T: Serialize>(report: &T) -> Result<(), String> {
    let line = serde_json::to_string(report).map_err(|e| format!("serializing report failed: {}", e))?;
    println!("{}", line);
    Ok(())
}

fn run_single(store: &mut PgStore, job: Job, cfg: &Config) -> Result<(), String> {
    let report = run_job(store, job, &cfg.catchup_limits()).map_err(|e| format!("{} aborted: {}", job, e))?;
    emit(&report)?;
    if report.is_failure() {
        return Err(format!("{} did not complete", job));
    }
    Ok(())
}

fn run(mode: Mode) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (hourly_job={} at :{:02}, daily_job={} at {:02}:{:02}, catchup_on_start={}, max_hourly_windows={}, max_daily_windows={})",
        cfg.hourly_job_enabled,
        cfg.hourly_job_minute,
        cfg.daily_job_enabled,
        cfg.daily_job_hour,
        cfg.daily_job_minute,
        cfg.catchup_on_start,
        cfg.max_hourly_windows_per_run,
        cfg.max_daily_windows_per_run
    );

    // 2) Connect DB
    let mut store = PgStore::connect(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    let applied = apply_database_migrations(store.connection())?;

    // 4) Dispatch
    match mode {
        Mode::Migrate => emit(&MigrationReport {
            kind: "migrate",
            applied,
        }),
        Mode::Serve => {
            // scheduled runs open their own connections
            drop(store);
            scheduler::run(&cfg)
        }
        Mode::Hourly { at } => run_single(&mut store, Job::Hourly { now: at.unwrap_or_else(Utc::now) }, &cfg),
        Mode::Catchup => run_single(&mut store, Job::Catchup(Granularity::Hourly), &cfg),
        Mode::Daily { date } => {
            let date = match date {
                Some(d) => d,
                None => Utc::now()
                    .date_naive()
                    .pred_opt()
                    .ok_or_else(|| "cannot determine yesterday's date".to_string())?,
            };
            run_single(&mut store, Job::Daily { date }, &cfg)
        }
        Mode::DailyCatchup => run_single(&mut store, Job::Catchup(Granularity::Daily), &cfg),
        Mode::Ingest { file } => {
            let readings = ingest::load_batch(&file).map_err(|e| format!("{}: {}", file.display(), e))?;
            info!("Parsed {} reading(s) from {}", readings.len(), file.display());
            let summary = ingest::ingest_readings(store.connection(), &readings).map_err(|e| e.to_string())?;
            emit(&summary)
        }
    }
}

fn parse_args<I>(args: I) -> Result<Cli, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;
    let mut mode: Option<String> = None;
    let mut operand: Option<String> = None;
    let mut at: Option<DateTime<Utc>> = None;
    let mut date: Option<NaiveDate> = None;

    while let Some(arg) = args.next() {
        if arg == "--" {
            break;
        }
        if !arg.starts_with("--") {
            if mode.is_none() {
                mode = Some(arg);
            } else if operand.is_none() {
                operand = Some(arg);
            } else {
                return Err(format!("unexpected argument: {}", arg));
            }
            continue;
        }

        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        };
        let value = match inline {
            Some(v) => v,
            None => args.next().ok_or_else(|| format!("`{}` requires a value", flag))?,
        };
        if value.is_empty() {
            return Err(format!("`{}` requires a value", flag));
        }
        match flag.as_str() {
            "--env-file" => {
                if env_file.replace(PathBuf::from(value)).is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
            }
            "--at" => {
                let parsed = DateTime::parse_from_rfc3339(&value)
                    .map_err(|e| format!("`--at` must be an RFC 3339 timestamp: {}", e))?;
                at = Some(parsed.with_timezone(&Utc));
            }
            "--date" => {
                let parsed = NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                    .map_err(|_| "`--date` must be in YYYY-MM-DD format".to_string())?;
                date = Some(parsed);
            }
            other => return Err(format!("unrecognised argument: {}", other)),
        }
    }

    let mode_name = mode.as_deref().unwrap_or("serve");
    if at.is_some() && mode_name != "hourly" {
        return Err("`--at` is only valid with the hourly mode".to_string());
    }
    if date.is_some() && mode_name != "daily" {
        return Err("`--date` is only valid with the daily mode".to_string());
    }
    if operand.is_some() && mode_name != "ingest" {
        return Err(format!("unexpected argument for {}: {}", mode_name, operand.unwrap_or_default()));
    }

    let mode = match mode_name {
        "serve" => Mode::Serve,
        "hourly" => Mode::Hourly { at },
        "catchup" => Mode::Catchup,
        "daily" => Mode::Daily { date },
        "daily-catchup" => Mode::DailyCatchup,
        "migrate" => Mode::Migrate,
        "ingest" => Mode::Ingest {
            file: operand
                .map(PathBuf::from)
                .ok_or_else(|| "ingest requires a file argument".to_string())?,
        },
        other => return Err(format!("unknown mode: {}\n{}", other, USAGE)),
    };
    Ok(Cli { mode, env_file })
}

fn cli_args() -> Result<Vec<String>, String> {
    std::env::args_os()
        .skip(1)
        .map(|a| a.into_string().map_err(|_| "argument contains invalid UTF-8".to_string()))
        .collect()
}

fn main() {
    let cli = match cli_args().and_then(parse_args) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(2);
        }
    };
    let loaded_env = match dotenv::load(cli.env_file) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "energy-rollup {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.mode) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(args: &[&str]) -> Result<Cli, String> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_to_serve() {
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.mode, Mode::Serve);
        assert_eq!(cli.env_file, None);
    }

    #[test]
    fn parses_modes_and_their_options() {
        let cli = parse(&["hourly", "--at", "2024-03-02T11:05:00+01:00"]).unwrap();
        assert_eq!(
            cli.mode,
            Mode::Hourly {
                at: Some(Utc.with_ymd_and_hms(2024, 3, 2, 10, 5, 0).unwrap())
            }
        );

        let cli = parse(&["--env-file=prod.env", "daily", "--date=2024-03-01"]).unwrap();
        assert_eq!(
            cli.mode,
            Mode::Daily {
                date: NaiveDate::from_ymd_opt(2024, 3, 1)
            }
        );
        assert_eq!(cli.env_file, Some(PathBuf::from("prod.env")));

        assert_eq!(parse(&["daily-catchup"]).unwrap().mode, Mode::DailyCatchup);
        assert_eq!(parse(&["catchup"]).unwrap().mode, Mode::Catchup);
        assert_eq!(parse(&["migrate"]).unwrap().mode, Mode::Migrate);
        assert_eq!(
            parse(&["ingest", "batch.json"]).unwrap().mode,
            Mode::Ingest {
                file: PathBuf::from("batch.json")
            }
        );
    }

    #[test]
    fn rejects_misplaced_or_malformed_options() {
        assert!(parse(&["catchup", "--at", "2024-03-02T11:05:00Z"]).is_err());
        assert!(parse(&["daily", "--date", "03/01/2024"]).is_err());
        assert!(parse(&["hourly", "--at"]).is_err());
        assert!(parse(&["ingest"]).is_err());
        assert!(parse(&["migrate", "extra"]).is_err());
        assert!(parse(&["rollup"]).is_err());
        assert!(parse(&["--env-file", "a", "--env-file", "b"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
    }
}
