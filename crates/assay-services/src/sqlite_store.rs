//! SQLite-backed job store.
//!
//! Every write runs in an IMMEDIATE transaction, which takes the database
//! write lock up front. A claim's select-then-update therefore cannot
//! interleave with another claim, in this process or any other.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use assay_core::JobState;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::job_store::{
    check_save, output_tags, EventType, InferenceEvent, JobRecord, JobStore, NewEvent, NewJob,
    OutputFile, StoreError, Tag,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    state          TEXT NOT NULL,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    remote_job_id  TEXT,
    model_json     TEXT NOT NULL,
    inputs_json    TEXT NOT NULL,
    owner          TEXT,
    error          TEXT,
    created_at     TEXT NOT NULL,
    started_at     TEXT,
    completed_at   TEXT,
    not_before     TEXT
);
CREATE INDEX IF NOT EXISTS jobs_state_created ON jobs (state, created_at, id);

CREATE TABLE IF NOT EXISTS inference_events (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id         INTEGER NOT NULL REFERENCES jobs (id),
    event_type     TEXT NOT NULL,
    state          TEXT NOT NULL,
    retry_count    INTEGER NOT NULL,
    remote_job_id  TEXT,
    response_code  INTEGER,
    message        TEXT,
    output_json    TEXT,
    at             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS inference_events_job ON inference_events (job_id, at, id);

CREATE TABLE IF NOT EXISTS output_files (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    uri            TEXT NOT NULL UNIQUE,
    file_type      TEXT NOT NULL,
    tags_json      TEXT NOT NULL,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_output_files (
    job_id         INTEGER NOT NULL REFERENCES jobs (id),
    file_id        INTEGER NOT NULL REFERENCES output_files (id),
    PRIMARY KEY (job_id, file_id)
);
";

const JOB_COLUMNS: &str = "id, state, retry_count, remote_job_id, model_json, inputs_json, \
                           owner, error, created_at, started_at, completed_at, not_before";

pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open or create a store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────────

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn parse_state(s: &str) -> Result<JobState, StoreError> {
    s.parse().map_err(StoreError::Corrupt)
}

fn corrupt_json(what: &str) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
    move |e| StoreError::Corrupt(format!("{what}: {e}"))
}

struct JobRow {
    id: i64,
    state: String,
    retry_count: i64,
    remote_job_id: Option<String>,
    model_json: String,
    inputs_json: String,
    owner: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    not_before: Option<String>,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            state: row.get(1)?,
            retry_count: row.get(2)?,
            remote_job_id: row.get(3)?,
            model_json: row.get(4)?,
            inputs_json: row.get(5)?,
            owner: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            not_before: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, StoreError> {
        Ok(JobRecord {
            id: self.id,
            state: parse_state(&self.state)?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| StoreError::Corrupt(format!("retry_count {}", self.retry_count)))?,
            remote_job_id: self.remote_job_id,
            model: serde_json::from_str(&self.model_json).map_err(corrupt_json("model_json"))?,
            inputs: serde_json::from_str(&self.inputs_json).map_err(corrupt_json("inputs_json"))?,
            owner: self.owner,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            not_before: self.not_before.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn fetch_job(conn: &Connection, id: i64) -> Result<Option<JobRecord>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    conn.query_row(&sql, params![id], JobRow::read)
        .optional()?
        .map(JobRow::into_record)
        .transpose()
}

fn write_job(conn: &Connection, record: &JobRecord) -> Result<(), StoreError> {
    let model = serde_json::to_string(&record.model).map_err(corrupt_json("model"))?;
    let inputs = serde_json::to_string(&record.inputs).map_err(corrupt_json("inputs"))?;
    conn.execute(
        "UPDATE jobs SET state = ?2, retry_count = ?3, remote_job_id = ?4, model_json = ?5,
                inputs_json = ?6, owner = ?7, error = ?8, started_at = ?9, completed_at = ?10,
                not_before = ?11
         WHERE id = ?1",
        params![
            record.id,
            record.state.as_str(),
            record.retry_count,
            record.remote_job_id,
            model,
            inputs,
            record.owner,
            record.error,
            record.started_at.map(ts),
            record.completed_at.map(ts),
            record.not_before.map(ts),
        ],
    )?;
    Ok(())
}

fn append_event(conn: &Connection, record: &JobRecord, event: NewEvent) -> Result<(), StoreError> {
    let ev = event.materialise(0, record, Utc::now());
    conn.execute(
        "INSERT INTO inference_events
            (job_id, event_type, state, retry_count, remote_job_id, response_code, message, output_json, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            ev.job_id,
            ev.event_type.as_str(),
            ev.state.as_str(),
            ev.retry_count,
            ev.remote_job_id,
            ev.response_code,
            ev.message,
            ev.output_json,
            ts(ev.at),
        ],
    )?;
    Ok(())
}

/// Mark a queued record running and log the start, inside the caller's
/// transaction.
fn start(conn: &Connection, mut record: JobRecord) -> Result<JobRecord, StoreError> {
    record.state = JobState::Running;
    record.started_at = Some(Utc::now());
    record.not_before = None;
    write_job(conn, &record)?;
    append_event(conn, &record, NewEvent::new(EventType::JobStarted))?;
    Ok(record)
}

fn read_file(conn: &Connection, file_id: i64) -> Result<OutputFile, StoreError> {
    let (id, uri, file_type, tags_json, created_at): (i64, String, String, String, String) = conn
        .query_row(
            "SELECT id, uri, file_type, tags_json, created_at FROM output_files WHERE id = ?1",
            params![file_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
    let tags: Vec<Tag> = serde_json::from_str(&tags_json).map_err(corrupt_json("tags_json"))?;
    Ok(OutputFile {
        id,
        uri,
        file_type,
        tags,
        created_at: parse_ts(&created_at)?,
    })
}

// ── JobStore ──────────────────────────────────────────────────────────────────

impl JobStore for SqliteJobStore {
    fn enqueue(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let model = serde_json::to_string(&job.model).map_err(corrupt_json("model"))?;
        let inputs = serde_json::to_string(&job.inputs).map_err(corrupt_json("inputs"))?;
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO jobs (state, retry_count, model_json, inputs_json, owner, created_at)
             VALUES (?1, 0, ?2, ?3, ?4, ?5)",
            params![JobState::Queued.as_str(), model, inputs, job.owner, ts(created_at)],
        )?;
        let id = tx.last_insert_rowid();
        let record = fetch_job(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        append_event(&tx, &record, NewEvent::new(EventType::JobCreated))?;
        tx.commit()?;
        tracing::debug!(job_id = id, model = %record.model.name, "job enqueued");
        Ok(record)
    }

    fn get(&self, id: i64) -> Result<JobRecord, StoreError> {
        let conn = self.lock()?;
        fetch_job(&conn, id)?.ok_or(StoreError::NotFound(id))
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE (?1 IS NULL OR state = ?1) ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![state.map(|s| s.as_str())], JobRow::read)?;
        rows.map(|row| row.map_err(StoreError::from).and_then(JobRow::into_record))
            .collect()
    }

    fn claim_oldest_queued(&self) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE state = ?1 AND (not_before IS NULL OR not_before <= ?2)
             ORDER BY created_at, id LIMIT 1"
        );
        let oldest = tx
            .query_row(&sql, params![JobState::Queued.as_str(), ts(Utc::now())], JobRow::read)
            .optional()?;
        let Some(row) = oldest else {
            return Ok(None);
        };
        let record = start(&tx, row.into_record()?)?;
        tx.commit()?;
        Ok(Some(record))
    }

    fn claim(&self, id: i64) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = fetch_job(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        if record.state != JobState::Queued {
            return Ok(None);
        }
        let record = start(&tx, record)?;
        tx.commit()?;
        Ok(Some(record))
    }

    fn save(&self, record: &JobRecord, event: Option<NewEvent>) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = fetch_job(&tx, record.id)?.ok_or(StoreError::NotFound(record.id))?;
        check_save(stored.state, record, event.as_ref())?;
        write_job(&tx, record)?;
        if let Some(event) = event {
            append_event(&tx, record, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn cancel(&self, id: i64, reason: &str) -> Result<JobRecord, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut record = fetch_job(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        let from = record.state;
        if !from.can_transition_to(JobState::Cancelled) {
            return Err(StoreError::Transition {
                id,
                source: assay_core::io::TransitionError {
                    from,
                    to: JobState::Cancelled,
                },
            });
        }
        record.state = JobState::Cancelled;
        record.error = Some(reason.to_string());
        record.completed_at = Some(Utc::now());
        write_job(&tx, &record)?;
        append_event(&tx, &record, NewEvent::new(EventType::JobCancelled).message(reason))?;
        tx.commit()?;
        Ok(record)
    }

    fn events(&self, id: i64) -> Result<Vec<InferenceEvent>, StoreError> {
        let conn = self.lock()?;
        if fetch_job(&conn, id)?.is_none() {
            return Err(StoreError::NotFound(id));
        }
        let mut stmt = conn.prepare(
            "SELECT id, job_id, event_type, state, retry_count, remote_job_id, response_code,
                    message, output_json, at
             FROM inference_events WHERE job_id = ?1 ORDER BY at, id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<u16>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, job_id, event_type, state, retry_count, remote_job_id, response_code, message, output_json, at) =
                row?;
            events.push(InferenceEvent {
                id,
                job_id,
                event_type: EventType::parse(&event_type)
                    .ok_or_else(|| StoreError::Corrupt(format!("event type {event_type:?}")))?,
                state: parse_state(&state)?,
                retry_count,
                remote_job_id,
                response_code,
                message,
                output_json,
                at: parse_ts(&at)?,
            });
        }
        Ok(events)
    }

    fn add_output_file(&self, job_id: i64, uri: &str, file_type: &str) -> Result<OutputFile, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if fetch_job(&tx, job_id)?.is_none() {
            return Err(StoreError::NotFound(job_id));
        }
        let tags = serde_json::to_string(&output_tags(file_type)).map_err(corrupt_json("tags"))?;
        tx.execute(
            "INSERT OR IGNORE INTO output_files (uri, file_type, tags_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![uri, file_type, tags, ts(Utc::now())],
        )?;
        let file_id: i64 =
            tx.query_row("SELECT id FROM output_files WHERE uri = ?1", params![uri], |row| row.get(0))?;
        tx.execute(
            "INSERT OR IGNORE INTO job_output_files (job_id, file_id) VALUES (?1, ?2)",
            params![job_id, file_id],
        )?;
        let file = read_file(&tx, file_id)?;
        tx.commit()?;
        Ok(file)
    }

    fn output_files(&self, job_id: i64) -> Result<Vec<OutputFile>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT file_id FROM job_output_files WHERE job_id = ?1 ORDER BY file_id")?;
        let ids = stmt
            .query_map(params![job_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter().map(|id| read_file(&conn, id)).collect()
    }
}
