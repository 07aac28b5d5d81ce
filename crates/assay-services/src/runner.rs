//! Synchronous scatter runner.
//!
//! Takes an IO list produced by scatter expansion and drives every pending
//! descriptor through one execution backend with bounded concurrency. All
//! invocations are rendered before anything is staged or dispatched, so a
//! malformed tool aborts the run with no partial output. Backend failures
//! are per job and never abort siblings.
//!
//! Job `i` is staged under `<work_dir>/<i>/inputs` (resolved input files
//! copied flat) and writes to `<work_dir>/<i>/outputs`. Both are emptied
//! before staging, so nothing from an earlier run of that index is visible
//! to the job or picked up as its output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use assay_core::config::RunConfig;
use assay_core::io::{self, IoListError};
use assay_core::template::{self, TemplateError};
use assay_core::{JobDescriptor, JobState, Tool};

use crate::backend::{self, Backend, BackendError, JobSpec};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    IoList(#[from] IoListError),
    #[error("job {index}: {source}")]
    Template {
        index: usize,
        source: TemplateError,
    },
    #[error("job {index}: staging inputs: {source}")]
    Staging {
        index: usize,
        source: std::io::Error,
    },
    #[error("job {index}: {source}")]
    Backend {
        index: usize,
        source: BackendError,
    },
}

/// Per-state counts after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Descriptors that were not pending and were left untouched.
    pub skipped: usize,
}

impl RunSummary {
    fn tally(list: &[JobDescriptor], dispatched: &[usize]) -> Self {
        let mut summary = RunSummary {
            skipped: list.len() - dispatched.len(),
            ..Self::default()
        };
        for job in dispatched.iter().map(|i| &list[*i]) {
            match job.state {
                JobState::Completed => summary.completed += 1,
                JobState::Failed => summary.failed += 1,
                _ => summary.errored += 1,
            }
        }
        summary
    }
}

pub struct Runner {
    backend: Arc<dyn Backend>,
    work_dir: PathBuf,
    concurrency: usize,
}

impl Runner {
    pub fn new(backend: Arc<dyn Backend>, config: &RunConfig) -> Self {
        // Bind mounts need absolute host paths.
        let work_dir = std::path::absolute(&config.work_dir).unwrap_or_else(|e| {
            tracing::warn!(dir = %config.work_dir.display(), error = %e, "cannot make work dir absolute");
            config.work_dir.clone()
        });
        Self {
            backend,
            work_dir,
            concurrency: config.concurrency.max(1),
        }
    }

    fn job_dirs(&self, index: usize) -> (PathBuf, PathBuf) {
        let root = self.work_dir.join(index.to_string());
        (root.join("inputs"), root.join("outputs"))
    }

    /// Render the job specs for the given descriptor indices.
    fn plan(
        &self,
        tool: &Tool,
        list: &[JobDescriptor],
        indices: &[usize],
    ) -> Result<Vec<(usize, JobSpec)>, RunError> {
        let cid = tool.content_id();
        indices
            .iter()
            .map(|&index| {
                let job = &list[index];
                if job.tool.cid != cid {
                    tracing::warn!(
                        index,
                        expected = %job.tool.cid,
                        actual = %cid,
                        "descriptor was expanded from a different tool revision"
                    );
                }
                let invocation = template::render(tool, job, self.backend.inputs_mount())
                    .map_err(|source| RunError::Template { index, source })?;
                let (inputs_dir, outputs_dir) = self.job_dirs(index);
                Ok((
                    index,
                    JobSpec {
                        invocation,
                        image: tool.image.clone(),
                        hints: tool.hints(),
                        inputs_dir,
                        outputs_dir,
                        outputs: tool.outputs.clone(),
                    },
                ))
            })
            .collect()
    }

    /// The exact command each pending descriptor would run, in list order.
    /// Inputs are staged so content-addressed backends see the real CID;
    /// nothing is dispatched.
    pub fn dry_run(&self, tool: &Tool, list: &[JobDescriptor]) -> Result<Vec<String>, RunError> {
        let pending = pending(list);
        self.plan(tool, list, &pending)?
            .iter()
            .map(|(index, spec)| {
                let index = *index;
                prepare(&list[index], spec)
                    .map_err(|source| RunError::Staging { index, source })?;
                self.backend
                    .dry_run(spec)
                    .map_err(|source| RunError::Backend { index, source })
            })
            .collect()
    }

    /// Run every `Created` descriptor in `list`, updating it in place.
    pub async fn run(&self, tool: &Tool, list: &mut [JobDescriptor]) -> Result<RunSummary, RunError> {
        let indices = pending(list);
        let specs = self.plan(tool, list, &indices)?;
        for &index in &indices {
            // Created → Queued is always a legal edge.
            let _ = list[index].transition(JobState::Queued);
        }

        tracing::info!(
            tool = %tool.name,
            backend = self.backend.name(),
            jobs = specs.len(),
            concurrency = self.concurrency,
            "dispatching jobs"
        );

        let snapshot: Vec<JobDescriptor> = indices.iter().map(|i| list[*i].clone()).collect();
        let finished: Vec<(usize, JobDescriptor)> = stream::iter(specs.into_iter().zip(snapshot))
            .map(|((index, spec), job)| async move { (index, self.run_one(index, job, spec).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for (index, job) in finished {
            list[index] = job;
        }

        let summary = RunSummary::tally(list, &indices);
        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            errored = summary.errored,
            skipped = summary.skipped,
            "run finished"
        );
        Ok(summary)
    }

    /// Read an IO list, run its pending entries and write it back.
    pub async fn run_io_list(&self, tool: &Tool, path: &Path) -> Result<RunSummary, RunError> {
        let mut list = io::read_io_list(path)?;
        let summary = self.run(tool, &mut list).await?;
        io::write_io_list(path, &list)?;
        Ok(summary)
    }

    /// Supersede every `failed`/`error` entry with a fresh descriptor and
    /// run only those.
    pub async fn retry_failed(&self, tool: &Tool, path: &Path) -> Result<RunSummary, RunError> {
        let mut list = io::read_io_list(path)?;
        let mut retried = 0;
        for job in list.iter_mut() {
            if matches!(job.state, JobState::Failed | JobState::Error) {
                *job = job.superseding();
                retried += 1;
            }
        }
        tracing::info!(path = %path.display(), retried, "retrying failed jobs");
        let summary = self.run(tool, &mut list).await?;
        io::write_io_list(path, &list)?;
        Ok(summary)
    }

    async fn run_one(&self, index: usize, mut job: JobDescriptor, spec: JobSpec) -> JobDescriptor {
        // Queued → Running.
        let _ = job.transition(JobState::Running);

        if let Err(e) = prepare(&job, &spec) {
            tracing::warn!(index, error = %e, "failed to stage inputs");
            settle(&mut job, JobState::Error, Some(format!("staging inputs: {e}")));
            return job;
        }

        let (handle, result) = backend::execute(self.backend.as_ref(), &spec).await;
        job.backend_job_id = handle.map(|h| h.id);
        match result {
            Ok(result) => {
                job.outputs.extend(result.outputs);
                tracing::info!(index, job_id = ?job.backend_job_id, "job completed");
                settle(&mut job, JobState::Completed, None);
            }
            Err(e) => {
                let state = match e {
                    BackendError::Execution { .. }
                    | BackendError::JobFailed { .. }
                    | BackendError::Timeout { .. } => JobState::Failed,
                    _ => JobState::Error,
                };
                tracing::warn!(index, state = %state, error = %e, "job did not complete");
                settle(&mut job, state, Some(e.to_string()));
            }
        }
        job
    }
}

fn pending(list: &[JobDescriptor]) -> Vec<usize> {
    list.iter()
        .enumerate()
        .filter(|(_, job)| job.state == JobState::Created)
        .map(|(i, _)| i)
        .collect()
}

fn settle(job: &mut JobDescriptor, state: JobState, err: Option<String>) {
    if let Err(e) = job.transition(state) {
        tracing::error!(error = %e, "illegal job transition");
        return;
    }
    job.err_msg = err;
}

/// Empty the job's input and output directories, then stage its inputs.
fn prepare(job: &JobDescriptor, spec: &JobSpec) -> std::io::Result<()> {
    for dir in [&spec.inputs_dir, &spec.outputs_dir] {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    std::fs::create_dir_all(&spec.outputs_dir)?;
    stage_inputs(job, &spec.inputs_dir)
}

/// Copy every resolved File input flat into `dir`. Two inputs with the same
/// file name are an error.
fn stage_inputs(job: &JobDescriptor, dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    for (slot, value) in &job.inputs {
        let Some(path) = value.file_path().map(Path::new) else {
            continue;
        };
        let Some(name) = path.file_name() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("input {slot} has no file name: {}", path.display()),
            ));
        };
        let target = dir.join(name);
        if target.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!(
                    "input {slot} collides with another input named {}",
                    name.to_string_lossy()
                ),
            ));
        }
        std::fs::copy(path, &target)?;
    }
    Ok(())
}
