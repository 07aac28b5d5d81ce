//! Scatter runner on the network backend, against a fake requester node and
//! a local content store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use assay_core::config::{NetworkConfig, RunConfig};
use assay_core::{io, scatter, JobState, Tool};
use assay_services::backend::network::PollPolicy;
use assay_services::backend::{NetworkBackend, RequesterClient};
use assay_services::content_store::{ContentStore, LocalContentStore};
use assay_services::Runner;

use crate::*;

#[derive(Clone)]
struct FakeRequester {
    /// Results become available on this poll.
    ready_on: u32,
    result_cid: String,
    polls: Arc<AtomicU32>,
    submitted: Arc<Mutex<Vec<Value>>>,
}

async fn handle_submit(State(fake): State<FakeRequester>, Json(body): Json<Value>) -> Json<Value> {
    let mut submitted = fake.submitted.lock().unwrap();
    submitted.push(body["spec"].clone());
    Json(json!({ "id": format!("net-{}", submitted.len()) }))
}

async fn handle_results(State(fake): State<FakeRequester>, UrlPath(_id): UrlPath<String>) -> Json<Value> {
    let poll = fake.polls.fetch_add(1, Ordering::SeqCst) + 1;
    if poll >= fake.ready_on {
        Json(json!({ "results": [ { "cid": fake.result_cid, "node_id": "node-1" } ] }))
    } else {
        Json(json!({ "results": [] }))
    }
}

async fn start_requester(ready_on: u32, result_cid: String) -> (FakeRequester, String) {
    let fake = FakeRequester {
        ready_on,
        result_cid,
        polls: Arc::new(AtomicU32::new(0)),
        submitted: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/api/v1/requester/submit", post(handle_submit))
        .route("/api/v1/requester/results/{id}", get(handle_results))
        .with_state(fake.clone());
    let base = serve(app).await.unwrap();
    (fake, base)
}

fn fold_tool() -> Tool {
    serde_json::from_value(json!({
        "name": "fold",
        "baseCommand": ["/bin/bash", "-c"],
        "arguments": ["fold $(inputs.protein.filepath) --out /outputs/$(inputs.protein.basename).txt"],
        "dockerPull": "ghcr.io/example/fold:1.0",
        "gpuBool": true,
        "memoryGB": 16,
        "inputs": { "protein": { "type": "File", "glob": ["*.pdb"] } },
        "outputs": { "result": { "type": "File", "glob": ["*.txt"] } }
    }))
    .unwrap()
}

struct Setup {
    root: std::path::PathBuf,
    store: Arc<LocalContentStore>,
    result_cid: String,
}

/// Input directory with one protein, and a pinned "published output".
fn setup() -> Setup {
    let root = temp_dir("network");
    write_files(&root.join("in"), &[("7n9g.pdb", "ATOM 1")]);
    let store = Arc::new(LocalContentStore::new(root.join("content")).unwrap());
    let published = root.join("published");
    write_files(&published, &[("7n9g.txt", "plddt 91.2")]);
    let result_cid = store.pin_dir(&published).unwrap();
    Setup {
        root,
        store,
        result_cid,
    }
}

fn runner(setup: &Setup, base: &str, policy: PollPolicy) -> Runner {
    let backend = NetworkBackend::new(
        &NetworkConfig::default(),
        Arc::new(RequesterClient::new(base)),
        setup.store.clone(),
    )
    .with_policy(policy);
    let config = RunConfig {
        work_dir: setup.root.join("work"),
        concurrency: 1,
    };
    Runner::new(Arc::new(backend), &config)
}

#[tokio::test]
async fn test_network_job_polls_until_results_and_fetches_outputs() {
    let setup = setup();
    let (fake, base) = start_requester(4, setup.result_cid.clone()).await;
    let policy = PollPolicy {
        interval: Duration::from_millis(10),
        max_attempts: 360,
    };
    let runner = runner(&setup, &base, policy);
    let tool = fold_tool();

    let io_path = setup.root.join("io.json");
    let list = scatter::expand_dir(&setup.root.join("in"), &tool).unwrap().descriptors;
    io::write_io_list(&io_path, &list).unwrap();

    let dry = runner.dry_run(&tool, &list).unwrap();
    assert_eq!(dry.len(), 1);
    assert!(dry[0].starts_with("bacalhau docker run --selector owner=labdao --gpu 1 --memory 16gb -i "));
    assert!(dry[0].contains("ghcr.io/example/fold:1.0 -- /bin/bash -c"));

    let summary = runner.run_io_list(&tool, &io_path).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(fake.polls.load(Ordering::SeqCst), 4);

    let submitted = fake.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    let spec = &submitted[0];
    assert_eq!(spec["engine"], "docker");
    assert_eq!(spec["resources"]["memory"], "16gb");
    assert_eq!(spec["resources"]["gpu"], "1");
    assert_eq!(spec["network"], "none");
    assert_eq!(spec["node_selectors"][0]["values"][0], "labdao");
    let input_cid = spec["inputs"][0]["cid"].as_str().unwrap();
    assert!(dry[0].contains(&format!("-i {input_cid} ")));
    let command = spec["entrypoint"][2].as_str().unwrap();
    assert!(command.contains("fold /inputs/7n9g.pdb --out /outputs/7n9g.txt"));

    let written = io::read_io_list(&io_path).unwrap();
    let job = &written[0];
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.backend_job_id.as_deref(), Some("net-1"));
    let result = job.outputs["result"].file_path().unwrap();
    assert!(result.ends_with("7n9g.txt"));
    assert_eq!(std::fs::read_to_string(result).unwrap(), "plddt 91.2");
}

#[tokio::test]
async fn test_network_job_times_out_after_attempt_ceiling() {
    let setup = setup();
    let (fake, base) = start_requester(u32::MAX, setup.result_cid.clone()).await;
    let policy = PollPolicy {
        interval: Duration::from_millis(5),
        max_attempts: 3,
    };
    let runner = runner(&setup, &base, policy);
    let tool = fold_tool();

    let mut list = scatter::expand_dir(&setup.root.join("in"), &tool).unwrap().descriptors;
    let summary = runner.run(&tool, &mut list).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(fake.polls.load(Ordering::SeqCst), 3);
    assert_eq!(list[0].state, JobState::Failed);
    assert!(list[0].err_msg.as_deref().unwrap().contains("after 3 polls"));
    assert_eq!(list[0].backend_job_id.as_deref(), Some("net-1"));
}
