//! Decentralised compute network backend.
//!
//! Inputs are pinned to the content store and mounted read-only at the
//! inputs mount; the network runs the image with `/bin/bash -c <command>`
//! on a node matching the owner selector, and publishes outputs as CIDs.
//! Completion is detected by polling the requester for results at a fixed
//! interval up to a hard attempt ceiling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use assay_core::config::NetworkConfig;
use assay_core::template::quote;

use super::{collect_outputs, Backend, BackendError, JobHandle, JobResult, JobSpec, PollStatus};
use crate::content_store::ContentStore;

// ── Job spec wire format ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkJob {
    pub engine: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub node_selectors: Vec<Selector>,
    pub resources: Resources,
    pub network: String,
    pub inputs: Vec<StorageSpec>,
    pub outputs: Vec<StorageSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub source: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResult {
    pub cid: String,
    #[serde(default)]
    pub node_id: String,
}

// ── Requester API ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait RequesterApi: Send + Sync {
    async fn submit(&self, job: &NetworkJob) -> Result<String, BackendError>;
    async fn results(&self, job_id: &str) -> Result<Vec<NetworkResult>, BackendError>;
}

/// HTTP client for a requester node.
pub struct RequesterClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    results: Vec<NetworkResult>,
}

impl RequesterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Status {
            service: "requester",
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RequesterApi for RequesterClient {
    async fn submit(&self, job: &NetworkJob) -> Result<String, BackendError> {
        let url = format!("{}/api/v1/requester/submit", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "spec": job }))
            .send()
            .await?;
        let body: SubmitResponse = Self::check(resp).await?.json().await?;
        Ok(body.id)
    }

    async fn results(&self, job_id: &str) -> Result<Vec<NetworkResult>, BackendError> {
        let url = format!("{}/api/v1/requester/results/{}", self.base_url, job_id);
        let resp = self.http.get(&url).send().await?;
        let body: ResultsResponse = Self::check(resp).await?.json().await?;
        Ok(body.results)
    }
}

// ── Polling ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            max_attempts: config.max_poll_attempts,
        }
    }
}

/// Poll until the requester reports at least one result.
///
/// Returns the first non-empty result list, or `Timeout` once
/// `max_attempts` polls have come back empty. Errors from the requester end
/// the wait immediately.
pub async fn wait_for_results(
    api: &dyn RequesterApi,
    job_id: &str,
    policy: PollPolicy,
) -> Result<Vec<NetworkResult>, BackendError> {
    for attempt in 1..=policy.max_attempts {
        let results = api.results(job_id).await?;
        if !results.is_empty() {
            tracing::debug!(job_id, attempt, results = results.len(), "results available");
            return Ok(results);
        }
        tracing::trace!(job_id, attempt, "no results yet");
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(BackendError::Timeout {
        job_id: job_id.to_string(),
        attempts: policy.max_attempts,
    })
}

// ── Backend ───────────────────────────────────────────────────────────────────

pub struct NetworkBackend {
    api: Arc<dyn RequesterApi>,
    content: Arc<dyn ContentStore>,
    cli: String,
    owner: String,
    inputs_mount: String,
    outputs_mount: String,
    policy: PollPolicy,
    /// job id → results, between poll and retrieve
    results: DashMap<String, Vec<NetworkResult>>,
}

impl NetworkBackend {
    pub fn new(
        config: &NetworkConfig,
        api: Arc<dyn RequesterApi>,
        content: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            api,
            content,
            cli: config.cli.clone(),
            owner: config.owner.clone(),
            inputs_mount: config.inputs_mount.clone(),
            outputs_mount: config.outputs_mount.clone(),
            policy: PollPolicy::from_config(config),
            results: DashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The command string handed to `/bin/bash -c` inside the container.
    fn command(spec: &JobSpec) -> String {
        spec.invocation.to_string()
    }

    pub fn job_for(&self, spec: &JobSpec, input_cid: &str) -> NetworkJob {
        let hints = spec.hints;
        NetworkJob {
            engine: "docker".to_string(),
            image: spec.image.clone(),
            entrypoint: vec!["/bin/bash".into(), "-c".into(), Self::command(spec)],
            node_selectors: vec![Selector {
                key: "owner".into(),
                operator: "=".into(),
                values: vec![self.owner.clone()],
            }],
            resources: Resources {
                memory: hints.memory_gb.map(|gb| format!("{gb}gb")),
                gpu: hints.gpu.then(|| "1".to_string()),
            },
            network: if hints.network { "full" } else { "none" }.to_string(),
            inputs: vec![StorageSpec {
                source: "ipfs".into(),
                name: "inputs".into(),
                cid: Some(input_cid.to_string()),
                path: self.inputs_mount.clone(),
            }],
            outputs: vec![StorageSpec {
                source: "ipfs".into(),
                name: "outputs".into(),
                cid: None,
                path: self.outputs_mount.clone(),
            }],
        }
    }

    fn cli_line(&self, spec: &JobSpec, input_cid: &str) -> String {
        let mut parts = vec![
            self.cli.clone(),
            "docker".into(),
            "run".into(),
            "--selector".into(),
            quote(&format!("owner={}", self.owner)),
        ];
        if spec.hints.gpu {
            parts.push("--gpu 1".into());
        }
        if let Some(gb) = spec.hints.memory_gb {
            parts.push(format!("--memory {gb}gb"));
        }
        if spec.hints.network {
            parts.push("--network full".into());
        }
        parts.push(format!("-i {}", quote(input_cid)));
        parts.push(quote(&spec.image));
        parts.push("-- /bin/bash -c".into());
        parts.push(quote(&Self::command(spec)));
        parts.join(" ")
    }
}

#[async_trait]
impl Backend for NetworkBackend {
    fn name(&self) -> &'static str {
        "network"
    }

    fn inputs_mount(&self) -> &str {
        &self.inputs_mount
    }

    fn dry_run(&self, spec: &JobSpec) -> Result<String, BackendError> {
        let cid = self.content.cid_of(&spec.inputs_dir)?;
        Ok(self.cli_line(spec, &cid))
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, BackendError> {
        let cid = self.content.pin_dir(&spec.inputs_dir)?;
        let job = self.job_for(spec, &cid);
        let id = self.api.submit(&job).await?;
        tracing::info!(job_id = %id, input_cid = %cid, image = %spec.image, "network job submitted");
        Ok(JobHandle {
            id,
            input_cid: Some(cid),
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, BackendError> {
        let results = wait_for_results(self.api.as_ref(), &handle.id, self.policy).await?;
        self.results.insert(handle.id.clone(), results);
        Ok(PollStatus::Completed)
    }

    async fn retrieve(&self, handle: &JobHandle, spec: &JobSpec) -> Result<JobResult, BackendError> {
        let (_, results) = self
            .results
            .remove(&handle.id)
            .ok_or_else(|| BackendError::UnknownJob(handle.id.clone()))?;
        std::fs::create_dir_all(&spec.outputs_dir)
            .map_err(|e| BackendError::Outputs(format!("{}: {e}", spec.outputs_dir.display())))?;
        for result in &results {
            self.content.fetch(&result.cid, &spec.outputs_dir)?;
        }
        let outputs = collect_outputs(&spec.outputs_dir, &spec.outputs)?;
        Ok(JobResult {
            backend_id: handle.id.clone(),
            outputs,
        })
    }
}
