//! Durable job records for the retry queue.
//!
//! The store is the only state shared between queue workers. Its contract:
//!
//! - `claim_oldest_queued` and `claim` are atomic claim-and-mark-running
//!   operations. Two concurrent callers never receive the same record.
//! - `save` writes a whole record plus at most one event in one step, and
//!   rejects state changes outside the lifecycle graph or without an event.
//!   The latest event of a record therefore always matches its state.
//! - Events are append-only.
//! - Output files are unique by URI.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use assay_core::io::TransitionError;
use assay_core::JobState;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Records ───────────────────────────────────────────────────────────────────

/// Model the inference service should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub name: String,
    pub storage_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub state: JobState,
    pub retry_count: u32,
    /// Client-generated id sent to the inference service. Assigned on first
    /// submission and kept across retries.
    pub remote_job_id: Option<String>,
    pub model: ModelRef,
    pub inputs: Map<String, Value>,
    pub owner: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// A queued record is not handed to the poller before this instant.
    /// Set while the worker that re-queued it waits out its backoff.
    pub not_before: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Whether the poller may claim this record at `now`.
    pub fn claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.not_before.map_or(true, |t| t <= now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub model: ModelRef,
    pub inputs: Map<String, Value>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobCreated,
    JobStarted,
    JobRetried,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobCreated => "job_created",
            EventType::JobStarted => "job_started",
            EventType::JobRetried => "job_retried",
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
            EventType::JobCancelled => "job_cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "job_created" => EventType::JobCreated,
            "job_started" => EventType::JobStarted,
            "job_retried" => EventType::JobRetried,
            "job_completed" => EventType::JobCompleted,
            "job_failed" => EventType::JobFailed,
            "job_cancelled" => EventType::JobCancelled,
            _ => return None,
        })
    }
}

/// Audit record, one per state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceEvent {
    pub id: i64,
    pub job_id: i64,
    pub event_type: EventType,
    /// Record state after the transition.
    pub state: JobState,
    pub retry_count: u32,
    pub remote_job_id: Option<String>,
    pub response_code: Option<u16>,
    pub message: Option<String>,
    /// Raw response body.
    pub output_json: Option<String>,
    pub at: DateTime<Utc>,
}

/// Event to append alongside a save. State, retry count and remote id are
/// taken from the record being saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub response_code: Option<u16>,
    pub message: Option<String>,
    pub output_json: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            response_code: None,
            message: None,
            output_json: None,
        }
    }

    pub fn code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn output(mut self, body: impl Into<String>) -> Self {
        self.output_json = Some(body.into());
        self
    }

    pub(crate) fn materialise(self, id: i64, record: &JobRecord, at: DateTime<Utc>) -> InferenceEvent {
        InferenceEvent {
            id,
            job_id: record.id,
            event_type: self.event_type,
            state: record.state,
            retry_count: record.retry_count,
            remote_job_id: record.remote_job_id.clone(),
            response_code: self.response_code,
            message: self.message,
            output_json: self.output_json,
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub id: i64,
    pub uri: String,
    pub file_type: String,
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
}

/// Tags every generated output file carries.
pub fn output_tags(file_type: &str) -> Vec<Tag> {
    vec![
        Tag {
            name: file_type.to_string(),
            kind: "filetype".to_string(),
        },
        Tag {
            name: "generated".to_string(),
            kind: "autogenerated".to_string(),
        },
    ]
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(i64),
    #[error("job {id}: {source}")]
    Transition { id: i64, source: TransitionError },
    #[error("job {id}: state change {from} -> {to} saved without an event")]
    EventRequired { id: i64, from: JobState, to: JobState },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

// ── Contract ──────────────────────────────────────────────────────────────────

pub trait JobStore: Send + Sync {
    /// Insert a new record in `Queued`, with a `JobCreated` event.
    fn enqueue(&self, job: NewJob) -> Result<JobRecord, StoreError>;

    fn get(&self, id: i64) -> Result<JobRecord, StoreError>;

    /// Records oldest first, optionally filtered by state.
    fn list(&self, state: Option<JobState>) -> Result<Vec<JobRecord>, StoreError>;

    /// Atomically move the oldest claimable `Queued` record to `Running`.
    /// Records whose `not_before` lies in the future are skipped.
    fn claim_oldest_queued(&self) -> Result<Option<JobRecord>, StoreError>;

    /// Atomically move record `id` to `Running` if it is still `Queued`,
    /// regardless of `not_before`. `None` means someone else holds it, or
    /// it left the queue.
    fn claim(&self, id: i64) -> Result<Option<JobRecord>, StoreError>;

    /// Replace the stored record, appending `event` in the same step.
    fn save(&self, record: &JobRecord, event: Option<NewEvent>) -> Result<(), StoreError>;

    /// External cancellation of a `Queued` or `Running` record.
    fn cancel(&self, id: i64, reason: &str) -> Result<JobRecord, StoreError>;

    /// Events of one record in append order.
    fn events(&self, id: i64) -> Result<Vec<InferenceEvent>, StoreError>;

    fn latest_event(&self, id: i64) -> Result<Option<InferenceEvent>, StoreError> {
        Ok(self.events(id)?.pop())
    }

    /// Record an output file for `job_id`. A URI seen before is linked to
    /// the job but not duplicated.
    fn add_output_file(&self, job_id: i64, uri: &str, file_type: &str) -> Result<OutputFile, StoreError>;

    fn output_files(&self, job_id: i64) -> Result<Vec<OutputFile>, StoreError>;
}

/// Checks shared by store implementations before a save is applied.
pub(crate) fn check_save(
    stored: JobState,
    record: &JobRecord,
    event: Option<&NewEvent>,
) -> Result<(), StoreError> {
    if stored == record.state {
        return Ok(());
    }
    if !stored.can_transition_to(record.state) {
        return Err(StoreError::Transition {
            id: record.id,
            source: TransitionError {
                from: stored,
                to: record.state,
            },
        });
    }
    if event.is_none() {
        return Err(StoreError::EventRequired {
            id: record.id,
            from: stored,
            to: record.state,
        });
    }
    Ok(())
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Process-local store. Claims and saves are serialised by one lock; reads
/// go straight to the maps.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<i64, JobRecord>,
    events: DashMap<i64, Vec<InferenceEvent>>,
    /// uri → file
    files: DashMap<String, OutputFile>,
    /// job id → file ids
    job_files: DashMap<i64, Vec<i64>>,
    next_job: AtomicI64,
    next_event: AtomicI64,
    next_file: AtomicI64,
    write_lock: Mutex<()>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn append(&self, record: &JobRecord, event: NewEvent) {
        let ev = event.materialise(Self::next(&self.next_event), record, Utc::now());
        self.events.entry(record.id).or_default().push(ev);
    }

    fn start(&self, mut record: JobRecord) -> JobRecord {
        record.state = JobState::Running;
        record.started_at = Some(Utc::now());
        record.not_before = None;
        self.jobs.insert(record.id, record.clone());
        self.append(&record, NewEvent::new(EventType::JobStarted));
        record
    }
}

impl JobStore for MemoryJobStore {
    fn enqueue(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let record = JobRecord {
            id: Self::next(&self.next_job),
            state: JobState::Queued,
            retry_count: 0,
            remote_job_id: None,
            model: job.model,
            inputs: job.inputs,
            owner: job.owner,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            not_before: None,
        };
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.jobs.insert(record.id, record.clone());
        self.append(&record, NewEvent::new(EventType::JobCreated));
        Ok(record)
    }

    fn get(&self, id: i64) -> Result<JobRecord, StoreError> {
        self.jobs
            .get(&id)
            .map(|r| r.clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<JobRecord>, StoreError> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|r| state.map_or(true, |s| r.state == s))
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    fn claim_oldest_queued(&self) -> Result<Option<JobRecord>, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Utc::now();
        let oldest = self
            .jobs
            .iter()
            .filter(|r| r.claimable_at(now))
            .min_by_key(|r| (r.created_at, r.id))
            .map(|r| r.clone());
        Ok(oldest.map(|record| self.start(record)))
    }

    fn claim(&self, id: i64) -> Result<Option<JobRecord>, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let record = self.get(id)?;
        if record.state != JobState::Queued {
            return Ok(None);
        }
        Ok(Some(self.start(record)))
    }

    fn save(&self, record: &JobRecord, event: Option<NewEvent>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let stored = self.get(record.id)?;
        check_save(stored.state, record, event.as_ref())?;
        self.jobs.insert(record.id, record.clone());
        if let Some(event) = event {
            self.append(record, event);
        }
        Ok(())
    }

    fn cancel(&self, id: i64, reason: &str) -> Result<JobRecord, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut record = self.get(id)?;
        if !record.state.can_transition_to(JobState::Cancelled) {
            return Err(StoreError::Transition {
                id,
                source: TransitionError {
                    from: record.state,
                    to: JobState::Cancelled,
                },
            });
        }
        record.state = JobState::Cancelled;
        record.error = Some(reason.to_string());
        record.completed_at = Some(Utc::now());
        self.jobs.insert(id, record.clone());
        self.append(&record, NewEvent::new(EventType::JobCancelled).message(reason));
        Ok(record)
    }

    fn events(&self, id: i64) -> Result<Vec<InferenceEvent>, StoreError> {
        if !self.jobs.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(self.events.get(&id).map(|e| e.clone()).unwrap_or_default())
    }

    fn add_output_file(&self, job_id: i64, uri: &str, file_type: &str) -> Result<OutputFile, StoreError> {
        if !self.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound(job_id));
        }
        let file = self
            .files
            .entry(uri.to_string())
            .or_insert_with(|| OutputFile {
                id: Self::next(&self.next_file),
                uri: uri.to_string(),
                file_type: file_type.to_string(),
                tags: output_tags(file_type),
                created_at: Utc::now(),
            })
            .clone();
        let mut linked = self.job_files.entry(job_id).or_default();
        if !linked.contains(&file.id) {
            linked.push(file.id);
        }
        Ok(file)
    }

    fn output_files(&self, job_id: i64) -> Result<Vec<OutputFile>, StoreError> {
        let ids = self.job_files.get(&job_id).map(|l| l.clone()).unwrap_or_default();
        let mut files: Vec<OutputFile> = self
            .files
            .iter()
            .filter(|f| ids.contains(&f.id))
            .map(|f| f.clone())
            .collect();
        files.sort_by_key(|f| f.id);
        Ok(files)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    pub(crate) fn new_job(name: &str) -> NewJob {
        let mut inputs = Map::new();
        inputs.insert("sequence".into(), json!("MKTAYIAK"));
        NewJob {
            model: ModelRef {
                name: name.into(),
                storage_uri: format!("s3://models/{name}"),
                endpoint: None,
            },
            inputs,
            owner: Some("0xabc".into()),
        }
    }

    /// Contract checks every store implementation must pass.
    pub(crate) fn exercise_contract(store: &dyn JobStore) {
        let a = store.enqueue(new_job("a")).unwrap();
        let b = store.enqueue(new_job("b")).unwrap();
        assert_eq!(a.state, JobState::Queued);
        assert_eq!(store.latest_event(a.id).unwrap().unwrap().event_type, EventType::JobCreated);

        // Oldest first.
        let claimed = store.claim_oldest_queued().unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        assert_eq!(claimed.state, JobState::Running);
        assert!(claimed.started_at.is_some());
        let started = store.latest_event(a.id).unwrap().unwrap();
        assert_eq!(started.event_type, EventType::JobStarted);
        assert_eq!(started.state, JobState::Running);

        // Compare-and-set claim.
        assert!(store.claim(a.id).unwrap().is_none());
        assert_eq!(store.claim(b.id).unwrap().unwrap().state, JobState::Running);
        assert!(store.claim_oldest_queued().unwrap().is_none());

        // Save without an event on a state change is rejected.
        let mut done = claimed.clone();
        done.state = JobState::Completed;
        assert!(matches!(
            store.save(&done, None),
            Err(StoreError::EventRequired { .. })
        ));

        // Retry edge, then an illegal one.
        let mut retry = claimed.clone();
        retry.state = JobState::Queued;
        retry.retry_count = 1;
        retry.remote_job_id = Some("r-1".into());
        store
            .save(&retry, Some(NewEvent::new(EventType::JobRetried).code(500)))
            .unwrap();
        let ev = store.latest_event(a.id).unwrap().unwrap();
        assert_eq!(ev.state, JobState::Queued);
        assert_eq!(ev.retry_count, 1);
        assert_eq!(ev.response_code, Some(500));
        assert_eq!(ev.remote_job_id.as_deref(), Some("r-1"));

        // Deferred records are skipped by the poller.
        let mut deferred = retry.clone();
        deferred.not_before = Some(Utc::now() + chrono::Duration::hours(1));
        store.save(&deferred, None).unwrap();
        assert!(store.claim_oldest_queued().unwrap().is_none());
        assert_eq!(store.get(a.id).unwrap().not_before, deferred.not_before);

        let mut bad = retry.clone();
        bad.state = JobState::Completed;
        assert!(matches!(
            store.save(&bad, Some(NewEvent::new(EventType::JobCompleted))),
            Err(StoreError::Transition { .. })
        ));

        // Cancellation.
        let cancelled = store.cancel(a.id, "operator").unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert_eq!(store.get(a.id).unwrap().state, JobState::Cancelled);
        assert!(matches!(store.cancel(a.id, "again"), Err(StoreError::Transition { .. })));
        let types: Vec<EventType> = store.events(a.id).unwrap().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::JobCreated,
                EventType::JobStarted,
                EventType::JobRetried,
                EventType::JobCancelled
            ]
        );

        // Output files dedupe by URI.
        let f1 = store.add_output_file(b.id, "s3://out/p.pdb", "pdb").unwrap();
        let f2 = store.add_output_file(b.id, "s3://out/p.pdb", "pdb").unwrap();
        assert_eq!(f1.id, f2.id);
        store.add_output_file(b.id, "s3://out/m.json", "metrics").unwrap();
        let files = store.output_files(b.id).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].tags, output_tags("pdb"));

        assert_eq!(store.list(Some(JobState::Running)).unwrap().len(), 1);
        assert_eq!(store.list(None).unwrap().len(), 2);
        assert!(matches!(store.get(999), Err(StoreError::NotFound(999))));
    }

    #[test]
    fn memory_store_honours_contract() {
        exercise_contract(&MemoryJobStore::new());
    }

    #[test]
    fn concurrent_claims_never_share_a_record() {
        let store = Arc::new(MemoryJobStore::new());
        for i in 0..50 {
            store.enqueue(new_job(&format!("m{i}"))).unwrap();
        }
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(r) = store.claim_oldest_queued().unwrap() {
                        got.push(r.id);
                    }
                    got
                })
            })
            .collect();
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 50);
        assert_eq!(all.len(), 50);
    }

    #[test]
    fn event_type_names_are_stable() {
        for ty in [
            EventType::JobCreated,
            EventType::JobStarted,
            EventType::JobRetried,
            EventType::JobCompleted,
            EventType::JobFailed,
            EventType::JobCancelled,
        ] {
            assert_eq!(EventType::parse(ty.as_str()), Some(ty));
            assert_eq!(serde_json::to_value(ty).unwrap(), json!(ty.as_str()));
        }
    }
}
