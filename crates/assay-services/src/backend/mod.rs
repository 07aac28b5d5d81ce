//! Execution backends.
//!
//! A backend takes a rendered [`JobSpec`] through submit → poll → retrieve.
//! Every backend can also print the exact command it would run (`dry_run`)
//! without executing anything.

pub mod container;
pub mod inference;
pub mod network;

use std::path::{Path, PathBuf};
use std::time::Duration;

use assay_core::template::Invocation;
use assay_core::tool::ToolOutput;
use assay_core::{ResourceHints, SlotValue};
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::content_store::ContentStoreError;

pub use container::ContainerBackend;
pub use inference::{InferenceBackend, InferenceClient, InferenceReply};
pub use network::{NetworkBackend, RequesterApi, RequesterClient};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("job {job_id} produced no results after {attempts} polls")]
    Timeout { job_id: String, attempts: u32 },
    #[error("container exited with code {code}: {output}")]
    Execution { code: i32, output: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("content store: {0}")]
    Content(#[from] ContentStoreError),
    #[error("unknown job handle {0}")]
    UnknownJob(String),
    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("output collection failed: {0}")]
    Outputs(String),
}

/// Everything a backend needs to run one job descriptor.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub invocation: Invocation,
    pub image: String,
    pub hints: ResourceHints,
    /// Host directory holding the staged input files.
    pub inputs_dir: PathBuf,
    /// Host directory that receives the job's outputs.
    pub outputs_dir: PathBuf,
    pub outputs: IndexMap<String, ToolOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Backend-assigned job identifier.
    pub id: String,
    /// CID of the pinned inputs, for content-addressed backends.
    pub input_cid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    Completed,
    Failed(String),
}

/// Outputs of a finished job keyed by output slot.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub backend_id: String,
    pub outputs: IndexMap<String, SlotValue>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Container path the job sees its inputs under. Templates render
    /// `.filepath` placeholders against this.
    fn inputs_mount(&self) -> &str;

    /// The exact command `submit` would run, as one shell line.
    fn dry_run(&self, spec: &JobSpec) -> Result<String, BackendError>;

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, BackendError>;

    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, BackendError>;

    async fn retrieve(&self, handle: &JobHandle, spec: &JobSpec) -> Result<JobResult, BackendError>;
}

const RUNNING_RECHECK: Duration = Duration::from_millis(500);

/// Submit, wait for completion, retrieve. Returns the handle alongside the
/// outcome so callers can record the backend id even on failure.
pub async fn execute(
    backend: &dyn Backend,
    spec: &JobSpec,
) -> (Option<JobHandle>, Result<JobResult, BackendError>) {
    let handle = match backend.submit(spec).await {
        Ok(handle) => handle,
        Err(e) => return (None, Err(e)),
    };
    tracing::debug!(backend = backend.name(), job_id = %handle.id, "job submitted");

    loop {
        match backend.poll(&handle).await {
            Ok(PollStatus::Running) => tokio::time::sleep(RUNNING_RECHECK).await,
            Ok(PollStatus::Completed) => break,
            Ok(PollStatus::Failed(reason)) => {
                let err = BackendError::JobFailed {
                    job_id: handle.id.clone(),
                    reason,
                };
                return (Some(handle), Err(err));
            }
            Err(e) => return (Some(handle), Err(e)),
        }
    }

    let result = backend.retrieve(&handle, spec).await;
    (Some(handle), result)
}

/// Resolve File output slots against the files present in `outputs_dir`.
///
/// Each slot takes the first file matching any of its patterns. Slots with
/// no match keep an unresolved placeholder.
pub fn collect_outputs(
    outputs_dir: &Path,
    outputs: &IndexMap<String, ToolOutput>,
) -> Result<IndexMap<String, SlotValue>, BackendError> {
    let root = outputs_dir.to_string_lossy();
    let escaped = glob::Pattern::escape(&root);

    let mut resolved = IndexMap::new();
    for (slot, output) in outputs.iter().filter(|(_, o)| o.is_file()) {
        let mut found = None;
        for pattern in &output.glob {
            let full = Path::new(&escaped).join(pattern);
            let paths = glob::glob(&full.to_string_lossy())
                .map_err(|e| BackendError::Outputs(format!("slot {slot}: {e}")))?;
            if let Some(path) = paths.flatten().find(|p| p.is_file()) {
                found = Some(path);
                break;
            }
        }
        let value = match found {
            Some(path) => SlotValue::file(path.to_string_lossy()),
            None => {
                tracing::warn!(slot = %slot, dir = %outputs_dir.display(), "no output matched");
                SlotValue::unresolved_file()
            }
        };
        resolved.insert(slot.clone(), value);
    }
    Ok(resolved)
}
