//! Local container runtime backend.
//!
//! Runs `<runtime> run [--gpus all] -v <in>:<mount> -v <out>:<mount> <image>
//! <base...> <arguments>` and blocks until the container exits. The dry-run
//! line is built from the same argv, so what is printed is what runs.

use async_trait::async_trait;
use dashmap::DashMap;

use assay_core::config::ContainerConfig;
use assay_core::template::quote;

use super::{collect_outputs, Backend, BackendError, JobHandle, JobResult, JobSpec, PollStatus};

pub struct ContainerBackend {
    runtime: String,
    inputs_mount: String,
    outputs_mount: String,
    /// job id → exit code of finished containers
    finished: DashMap<String, i32>,
}

impl ContainerBackend {
    pub fn new(config: &ContainerConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            inputs_mount: config.inputs_mount.clone(),
            outputs_mount: config.outputs_mount.clone(),
            finished: DashMap::new(),
        }
    }

    /// Runtime flags and image, everything before the tool's own command.
    fn prefix(&self, spec: &JobSpec) -> Vec<String> {
        let mut argv = vec![self.runtime.clone(), "run".to_string()];
        if spec.hints.gpu {
            argv.push("--gpus".to_string());
            argv.push("all".to_string());
        }
        argv.push("-v".to_string());
        argv.push(format!("{}:{}", spec.inputs_dir.display(), self.inputs_mount));
        argv.push("-v".to_string());
        argv.push(format!("{}:{}", spec.outputs_dir.display(), self.outputs_mount));
        argv.push(spec.image.clone());
        argv
    }

    pub fn argv(&self, spec: &JobSpec) -> Vec<String> {
        let mut argv = self.prefix(spec);
        argv.extend(spec.invocation.argv());
        argv
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    fn inputs_mount(&self) -> &str {
        &self.inputs_mount
    }

    fn dry_run(&self, spec: &JobSpec) -> Result<String, BackendError> {
        let prefix: Vec<String> = self.prefix(spec).iter().map(|t| quote(t)).collect();
        Ok(format!("{} {}", prefix.join(" "), spec.invocation))
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, BackendError> {
        let argv = self.argv(spec);
        let id = uuid::Uuid::new_v4().to_string();
        std::fs::create_dir_all(&spec.outputs_dir).map_err(|e| BackendError::Spawn {
            program: self.runtime.clone(),
            source: e,
        })?;

        tracing::info!(job_id = %id, image = %spec.image, "starting container");
        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .map_err(|e| BackendError::Spawn {
                program: self.runtime.clone(),
                source: e,
            })?;

        let code = output.status.code().unwrap_or(-1);
        self.finished.insert(id.clone(), code);
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            tracing::warn!(job_id = %id, code, "container exited with failure");
            return Err(BackendError::Execution {
                code,
                output: combined,
            });
        }

        Ok(JobHandle {
            id,
            input_cid: None,
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, BackendError> {
        match self.finished.get(&handle.id).map(|code| *code) {
            Some(0) => Ok(PollStatus::Completed),
            Some(code) => Ok(PollStatus::Failed(format!("exit code {code}"))),
            None => Err(BackendError::UnknownJob(handle.id.clone())),
        }
    }

    async fn retrieve(&self, handle: &JobHandle, spec: &JobSpec) -> Result<JobResult, BackendError> {
        let outputs = collect_outputs(&spec.outputs_dir, &spec.outputs)?;
        self.finished.remove(&handle.id);
        Ok(JobResult {
            backend_id: handle.id.clone(),
            outputs,
        })
    }
}
