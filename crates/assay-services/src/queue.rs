//! Retry-scheduling queue for the inference service.
//!
//! One poller task claims the oldest queued record from the store and hands
//! it to a fixed pool of workers over a bounded channel. A worker owns its
//! record until the record reaches a terminal state, resolving retries
//! inline:
//!
//! | response            | action                                           |
//! |---------------------|--------------------------------------------------|
//! | 2xx                 | record files and scores, `completed`             |
//! | 504                 | `failed`, no retry                               |
//! | 404, under ceiling  | re-queue, resubmit immediately                   |
//! | 5xx, under ceiling  | re-queue, sleep a jittered backoff, resubmit     |
//! | anything else       | `failed`, response code kept in the event        |
//!
//! The remote job id is generated once per record and reused on every
//! resubmission of that record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use assay_core::config::QueueConfig;
use assay_core::JobState;

use crate::backend::{BackendError, InferenceBackend, InferenceReply};
use crate::backoff::Backoff;
use crate::job_store::{EventType, JobRecord, JobStore, NewEvent, StoreError};
use crate::response::{self, ResponseError};

// ── Policy ────────────────────────────────────────────────────────────────────

/// Response class of an inference reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    GatewayTimeout,
    NotFound,
    ServerError,
    Other,
}

pub fn classify(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        504 => Outcome::GatewayTimeout,
        404 => Outcome::NotFound,
        500..=599 => Outcome::ServerError,
        _ => Outcome::Other,
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub not_found_retries: u32,
    pub server_error_retries: u32,
    pub backoff: Backoff,
    pub primary_key: String,
}

impl QueueSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            poll_interval: config.poll_interval(),
            not_found_retries: config.not_found_retries,
            server_error_retries: config.server_error_retries,
            backoff: Backoff::new(
                Duration::from_millis(config.backoff_base_ms),
                config.backoff_factor,
                Duration::from_millis(config.backoff_jitter_ms),
            ),
            primary_key: config.primary_key.clone(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job store: {0}")]
    Store(#[from] StoreError),
    #[error("job {job_id}: {source}")]
    Backend { job_id: i64, source: BackendError },
    #[error("job {job_id}: {source}")]
    Response { job_id: i64, source: ResponseError },
}

impl QueueError {
    /// Fatal errors stop the poller. Everything else concerns one record.
    pub fn is_fatal(&self) -> bool {
        match self {
            QueueError::Store(e) => !matches!(
                e,
                StoreError::NotFound(_)
                    | StoreError::Transition { .. }
                    | StoreError::EventRequired { .. }
            ),
            QueueError::Backend { .. } | QueueError::Response { .. } => false,
        }
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

pub struct RetryQueue {
    store: Arc<dyn JobStore>,
    backend: Arc<dyn InferenceBackend>,
    settings: QueueSettings,
}

impl RetryQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        backend: Arc<dyn InferenceBackend>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            backend,
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Run the poller and worker pool until a fatal error.
    ///
    /// Non-fatal errors are logged and the pool keeps going. A fatal error
    /// stops the poller; records already handed to workers are not revoked.
    pub async fn run(self: Arc<Self>) -> Result<(), QueueError> {
        let workers = self.settings.max_workers.max(1);
        let (job_tx, job_rx) = mpsc::channel::<JobRecord>(workers);
        let (err_tx, mut err_rx) = mpsc::channel::<QueueError>(workers);
        let job_rx = Arc::new(Mutex::new(job_rx));

        tracing::info!(
            workers,
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "retry queue started"
        );

        let mut worker_handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let queue = self.clone();
            let job_rx = job_rx.clone();
            let err_tx = err_tx.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let next = job_rx.lock().await.recv().await;
                    let Some(record) = next else { break };
                    let job_id = record.id;
                    tracing::debug!(worker, job_id, "worker picked up job");
                    if let Err(e) = queue.process(record).await {
                        if err_tx.send(e).await.is_err() {
                            break;
                        }
                    }
                }
            }));
        }

        let poller = {
            let queue = self.clone();
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                loop {
                    match queue.store.claim_oldest_queued() {
                        Ok(Some(record)) => {
                            if job_tx.send(record).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => tokio::time::sleep(queue.settings.poll_interval).await,
                        Err(e) => {
                            let _ = err_tx.send(e.into()).await;
                            break;
                        }
                    }
                }
            })
        };
        drop(err_tx);

        while let Some(err) = err_rx.recv().await {
            if err.is_fatal() {
                tracing::error!(error = %err, "retry queue stopping");
                poller.abort();
                return Err(err);
            }
            tracing::warn!(error = %err, "job processing error");
        }

        for handle in worker_handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Drive one claimed (`Running`) record to a terminal state. Returns the
    /// state the record was left in. If another claimant takes the record
    /// while it waits to be resubmitted, this worker lets go of it.
    pub async fn process(&self, mut record: JobRecord) -> Result<JobState, QueueError> {
        if record.remote_job_id.is_none() {
            record.remote_job_id = Some(uuid::Uuid::new_v4().to_string());
            self.store.save(&record, None)?;
        }

        loop {
            let remote_id = record.remote_job_id.clone().unwrap_or_default();
            tracing::info!(
                job_id = record.id,
                remote_id = %remote_id,
                retry_count = record.retry_count,
                model = %record.model.name,
                "submitting to inference service"
            );

            let reply = match self
                .backend
                .submit(&record.model, &remote_id, &record.inputs)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    let message = e.to_string();
                    self.fail(&mut record, None, &message)?;
                    return Err(QueueError::Backend {
                        job_id: record.id,
                        source: e,
                    });
                }
            };

            let delay = match classify(reply.status) {
                Outcome::Success => return self.complete(record, reply),
                Outcome::GatewayTimeout => {
                    tracing::warn!(job_id = record.id, "gateway timeout, not retrying");
                    self.fail(&mut record, Some(&reply), "gateway timeout")?;
                    return Ok(record.state);
                }
                Outcome::NotFound if record.retry_count < self.settings.not_found_retries => {
                    Duration::ZERO
                }
                Outcome::ServerError if record.retry_count < self.settings.server_error_retries => {
                    // Mean grows with the retry count after this increment.
                    self.settings.backoff.delay(record.retry_count + 1)
                }
                _ => {
                    tracing::warn!(
                        job_id = record.id,
                        status = reply.status,
                        retry_count = record.retry_count,
                        "giving up on job"
                    );
                    let message = format!(
                        "HTTP {} after {} retries",
                        reply.status, record.retry_count
                    );
                    self.fail(&mut record, Some(&reply), &message)?;
                    return Ok(record.state);
                }
            };

            self.requeue(&mut record, &reply, delay)?;
            if !delay.is_zero() {
                tracing::info!(
                    job_id = record.id,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }

            match self.store.claim(record.id)? {
                Some(claimed) => record = claimed,
                None => {
                    let current = self.store.get(record.id)?.state;
                    tracing::info!(job_id = record.id, state = %current, "job left the queue during retry");
                    return Ok(current);
                }
            }
        }
    }

    fn requeue(
        &self,
        record: &mut JobRecord,
        reply: &InferenceReply,
        delay: Duration,
    ) -> Result<(), QueueError> {
        record.retry_count += 1;
        record.state = JobState::Queued;
        // Held past the delay by one poll interval so the poller does not
        // race the worker that resumes it.
        record.not_before = chrono::Duration::from_std(delay + self.settings.poll_interval)
            .ok()
            .map(|d| Utc::now() + d);
        tracing::info!(
            job_id = record.id,
            status = reply.status,
            retry_count = record.retry_count,
            "re-queueing job"
        );
        let event = NewEvent::new(EventType::JobRetried)
            .code(reply.status)
            .message(reply.body.clone());
        self.store.save(record, Some(event))?;
        Ok(())
    }

    fn fail(
        &self,
        record: &mut JobRecord,
        reply: Option<&InferenceReply>,
        message: &str,
    ) -> Result<(), QueueError> {
        record.state = JobState::Failed;
        record.error = Some(message.to_string());
        record.completed_at = Some(Utc::now());
        let mut event = NewEvent::new(EventType::JobFailed).message(message);
        if let Some(reply) = reply {
            event = event.code(reply.status).output(reply.body.clone());
        }
        self.store.save(record, Some(event))?;
        tracing::info!(job_id = record.id, error = message, "job failed");
        Ok(())
    }

    fn complete(&self, mut record: JobRecord, reply: InferenceReply) -> Result<JobState, QueueError> {
        let parsed = match response::parse(&reply.body, &self.settings.primary_key) {
            Ok(parsed) => parsed,
            Err(e) => {
                let message = format!("unparseable response: {e}");
                self.fail(&mut record, Some(&reply), &message)?;
                return Err(QueueError::Response {
                    job_id: record.id,
                    source: e,
                });
            }
        };
        tracing::debug!(job_id = record.id, response = %parsed.pretty(), "parsed inference response");

        record.state = JobState::Completed;
        record.error = None;
        record.completed_at = Some(Utc::now());
        let event = NewEvent::new(EventType::JobCompleted)
            .code(reply.status)
            .output(reply.body);
        // A record cancelled mid-request fails here, before any file is linked.
        self.store.save(&record, Some(event))?;

        for (key, file) in &parsed.files {
            self.store.add_output_file(record.id, &file.uri, key)?;
        }
        if let Some(primary) = &parsed.primary {
            self.store
                .add_output_file(record.id, &primary.uri, &self.settings.primary_key)?;
        }
        tracing::info!(
            job_id = record.id,
            files = parsed.files.len() + usize::from(parsed.primary.is_some()),
            scores = parsed.scores.len(),
            "job completed"
        );
        Ok(record.state)
    }
}
