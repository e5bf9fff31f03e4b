use super::{apply_status, generate_slug, new_pending_run, RunStore, StoreError};
use crate::config::SLUG_ATTEMPTS;
use chrono::{DateTime, SecondsFormat, Utc};
use latprobe_common::{HttpMethod, Run, RunParameters, RunStatus, Sample};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  slug TEXT NOT NULL UNIQUE,
  parameters_json TEXT NOT NULL,
  status TEXT NOT NULL,
  started_at TEXT,
  completed_at TEXT,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS samples (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
  endpoint_url TEXT NOT NULL,
  method TEXT NOT NULL,
  request_number INTEGER NOT NULL,
  latency_ms REAL NOT NULL,
  request_size_bytes INTEGER NOT NULL,
  response_size_bytes INTEGER NOT NULL,
  status_code INTEGER NOT NULL,
  error_message TEXT,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_samples_run ON samples (run_id, endpoint_url);
";

const RUN_COLUMNS: &str =
    "id, slug, parameters_json, status, started_at, completed_at, created_at";

const SAMPLE_COLUMNS: &str = "run_id, endpoint_url, method, request_number, latency_ms, \
     request_size_bytes, response_size_bytes, status_code, error_message, created_at";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly,
            ) => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Write(err.to_string()),
        }
    }
}

/// SQLite-backed store. One connection, serialized behind a mutex; WAL mode
/// keeps readers of other processes off the writer's back.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|err| StoreError::Unavailable(format!("Failed to open SQLite: {err}")))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "sqlite store opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| StoreError::Unavailable(format!("Failed to open SQLite: {err}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("SQLite connection lock poisoned".to_string()))
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, parameters: RunParameters) -> Result<Run, StoreError> {
        let conn = self.conn()?;
        let parameters_json = serde_json::to_string(&parameters)
            .map_err(|err| StoreError::Write(format!("Failed to serialize parameters: {err}")))?;
        let mut rng = rand::thread_rng();

        for _ in 0..SLUG_ATTEMPTS {
            let slug = generate_slug(&mut rng);
            let taken: Option<String> = conn
                .query_row("SELECT id FROM runs WHERE slug = ?1 LIMIT 1;", params![slug], |row| {
                    row.get(0)
                })
                .optional()?;
            if taken.is_some() {
                continue;
            }

            let run = new_pending_run(parameters, slug);
            conn.execute(
                "INSERT INTO runs (id, slug, parameters_json, status, started_at, completed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5);",
                params![
                    run.id.to_string(),
                    run.slug,
                    parameters_json,
                    run.status.as_str(),
                    format_timestamp(&run.created_at),
                ],
            )?;
            return Ok(run);
        }
        Err(StoreError::SlugExhausted(SLUG_ATTEMPTS))
    }

    fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<Run, StoreError> {
        let conn = self.conn()?;
        let mut run = load_run(&conn, "id", &run_id.to_string())?.ok_or(StoreError::NotFound(run_id))?;
        apply_status(&mut run, status, at)?;
        conn.execute(
            "UPDATE runs SET status = ?2, started_at = ?3, completed_at = ?4 WHERE id = ?1;",
            params![
                run_id.to_string(),
                run.status.as_str(),
                run.started_at.as_ref().map(format_timestamp),
                run.completed_at.as_ref().map(format_timestamp),
            ],
        )?;
        Ok(run)
    }

    fn append_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = conn.execute(
            &format!("INSERT INTO samples ({SAMPLE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);"),
            params![
                sample.run_id.to_string(),
                sample.endpoint_url,
                sample.method.as_str(),
                sample.request_number,
                sample.latency_ms,
                sample.request_size_bytes as i64,
                sample.response_size_bytes as i64,
                sample.status_code,
                sample.error_message,
                format_timestamp(&sample.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                Err(StoreError::NotFound(sample.run_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get_run_by_id(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        load_run(&*self.conn()?, "id", &run_id.to_string())
    }

    fn get_run_by_slug(&self, slug: &str) -> Result<Option<Run>, StoreError> {
        load_run(&*self.conn()?, "slug", slug)
    }

    fn list_samples(&self, run_id: Uuid, endpoint: Option<&str>) -> Result<Vec<Sample>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples
             WHERE run_id = ?1 AND (?2 IS NULL OR endpoint_url = ?2)
             ORDER BY id ASC;"
        ))?;
        let rows = stmt.query_map(params![run_id.to_string(), endpoint], raw_sample)?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?.into_sample()?);
        }
        Ok(samples)
    }

    fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1;"
        ))?;
        let rows = stmt.query_map(params![limit as i64], raw_run)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }

    fn delete_run(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM runs WHERE id = ?1;", params![run_id.to_string()])?;
        Ok(deleted > 0)
    }
}

// --- Row decoding ---

struct RawRun {
    id: String,
    slug: String,
    parameters_json: String,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
}

struct RawSample {
    run_id: String,
    endpoint_url: String,
    method: String,
    request_number: u32,
    latency_ms: f64,
    request_size_bytes: i64,
    response_size_bytes: i64,
    status_code: u16,
    error_message: Option<String>,
    created_at: String,
}

fn load_run(conn: &Connection, column: &str, value: &str) -> Result<Option<Run>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE {column} = ?1 LIMIT 1;"),
            params![value],
            raw_run,
        )
        .optional()?;
    raw.map(RawRun::into_run).transpose()
}

fn raw_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        slug: row.get(1)?,
        parameters_json: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn raw_sample(row: &Row<'_>) -> rusqlite::Result<RawSample> {
    Ok(RawSample {
        run_id: row.get(0)?,
        endpoint_url: row.get(1)?,
        method: row.get(2)?,
        request_number: row.get(3)?,
        latency_ms: row.get(4)?,
        request_size_bytes: row.get(5)?,
        response_size_bytes: row.get(6)?,
        status_code: row.get(7)?,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl RawRun {
    fn into_run(self) -> Result<Run, StoreError> {
        Ok(Run {
            id: parse_uuid(&self.id)?,
            slug: self.slug,
            parameters: serde_json::from_str(&self.parameters_json)
                .map_err(|err| StoreError::Corrupt(format!("run parameters: {err}")))?,
            status: self
                .status
                .parse::<RunStatus>()
                .map_err(|err| StoreError::Corrupt(err.to_string()))?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl RawSample {
    fn into_sample(self) -> Result<Sample, StoreError> {
        Ok(Sample {
            run_id: parse_uuid(&self.run_id)?,
            endpoint_url: self.endpoint_url,
            method: self
                .method
                .parse::<HttpMethod>()
                .map_err(|err| StoreError::Corrupt(err.to_string()))?,
            request_number: self.request_number,
            latency_ms: self.latency_ms,
            request_size_bytes: self.request_size_bytes.max(0) as u64,
            response_size_bytes: self.response_size_bytes.max(0) as u64,
            status_code: self.status_code,
            error_message: self.error_message,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|err| StoreError::Corrupt(format!("run id {value:?}: {err}")))
}

/// Fixed-width so lexical order matches time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp {value:?}: {err}")))
}
