//! Retry queue against a fake inference service over real HTTP, with the
//! SQLite job store on disk.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Map, Value};

use assay_core::JobState;
use assay_services::backend::InferenceClient;
use assay_services::backoff::Backoff;
use assay_services::job_store::{EventType, ModelRef, NewJob};
use assay_services::{JobStore, QueueSettings, RetryQueue, SqliteJobStore};

use crate::*;

/// Replies with scripted status codes; the last one repeats.
#[derive(Clone, Default)]
struct FakeInference {
    statuses: Arc<Mutex<VecDeque<u16>>>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeInference {
    fn scripted(statuses: &[u16]) -> Self {
        let fake = Self::default();
        fake.statuses.lock().unwrap().extend(statuses);
        fake
    }

    fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle_infer(
    State(fake): State<FakeInference>,
    Path(model): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, String) {
    fake.requests.lock().unwrap().push((model, body.clone()));
    let status = {
        let mut statuses = fake.statuses.lock().unwrap();
        if statuses.len() > 1 {
            statuses.pop_front().unwrap_or(500)
        } else {
            statuses.front().copied().unwrap_or(500)
        }
    };
    let reply = if status == 200 {
        json!({
            "response": {
                "uuid": body["uuid"],
                "pdb": { "uri": "s3://results/best.pdb" },
                "plddt": 88.1,
                "ranked": [ { "uri": "s3://results/rank0.pdb" }, { "uri": "s3://results/rank1.pdb" } ]
            }
        })
        .to_string()
    } else {
        format!("upstream status {status}")
    };
    (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), reply)
}

async fn start_fake(statuses: &[u16]) -> (FakeInference, String) {
    let fake = FakeInference::scripted(statuses);
    let app = Router::new()
        .route("/{model}", post(handle_infer))
        .with_state(fake.clone());
    let base = serve(app).await.unwrap();
    (fake, base)
}

fn settings() -> QueueSettings {
    QueueSettings {
        max_workers: 2,
        poll_interval: Duration::from_millis(20),
        not_found_retries: 1,
        server_error_retries: 2,
        backoff: Backoff::none(),
        primary_key: "pdb".into(),
    }
}

fn fold_job() -> NewJob {
    let mut inputs = Map::new();
    inputs.insert("sequence".into(), json!("MKTAYIAKQR"));
    inputs.insert("num_recycles".into(), json!(3));
    NewJob {
        model: ModelRef {
            name: "colabfold".into(),
            storage_uri: "s3://models/colabfold".into(),
            endpoint: None,
        },
        inputs,
        owner: Some("0xfeed".into()),
    }
}

/// Enqueue one job, run the queue until it is terminal, return the store.
async fn run_to_terminal(base: &str) -> (Arc<SqliteJobStore>, i64) {
    let db = temp_dir("inference").join("jobs.db");
    let store = Arc::new(SqliteJobStore::open(&db).unwrap());
    let id = store.enqueue(fold_job()).unwrap().id;

    let client = InferenceClient::new(base, Duration::from_secs(5)).unwrap();
    let queue = Arc::new(RetryQueue::new(store.clone(), Arc::new(client), settings()));
    let handle = tokio::spawn(queue.run());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = store.get(id).unwrap().state;
        if state.is_terminal() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job stuck in {state}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.abort();
    (store, id)
}

#[tokio::test]
async fn test_not_found_then_success_completes() {
    let (fake, base) = start_fake(&[404, 200]).await;
    let (store, id) = run_to_terminal(&base).await;

    let record = store.get(id).unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.retry_count, 1);

    let requests = fake.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].0, "colabfold");
    assert_eq!(requests[0].1["uuid"], requests[1].1["uuid"]);
    assert_eq!(
        requests[0].1["uuid"].as_str(),
        record.remote_job_id.as_deref()
    );
    assert_eq!(requests[0].1["model_uri"], "s3://models/colabfold");
    assert_eq!(requests[0].1["inputs"]["sequence"], json!(["MKTAYIAKQR"]));
    assert_eq!(requests[0].1["inputs"]["num_recycles"], json!([3]));

    let files = store.output_files(id).unwrap();
    let uris: Vec<&str> = files.iter().map(|f| f.uri.as_str()).collect();
    assert_eq!(
        uris,
        vec!["s3://results/rank0.pdb", "s3://results/rank1.pdb", "s3://results/best.pdb"]
    );
    assert!(files.iter().all(|f| f.tags.len() == 2));

    let last = store.latest_event(id).unwrap().unwrap();
    assert_eq!(last.event_type, EventType::JobCompleted);
    assert_eq!(last.response_code, Some(200));
    assert_eq!(last.state, JobState::Completed);
}

#[tokio::test]
async fn test_gateway_timeout_fails_without_retry() {
    let (fake, base) = start_fake(&[504]).await;
    let (store, id) = run_to_terminal(&base).await;

    assert_eq!(store.get(id).unwrap().state, JobState::Failed);
    assert_eq!(fake.requests().len(), 1);
    let last = store.latest_event(id).unwrap().unwrap();
    assert_eq!(last.response_code, Some(504));
}

#[tokio::test]
async fn test_server_errors_exhaust_retry_ceiling() {
    let (fake, base) = start_fake(&[500]).await;
    let (store, id) = run_to_terminal(&base).await;

    let record = store.get(id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.retry_count, 2);
    assert_eq!(fake.requests().len(), 3);

    let retries = store
        .events(id)
        .unwrap()
        .iter()
        .filter(|e| e.event_type == EventType::JobRetried)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_unreachable_service_fails_job() {
    let (store, id) = run_to_terminal("http://127.0.0.1:9").await;
    let record = store.get(id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(record.error.is_some());
}
