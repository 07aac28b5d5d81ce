//! Remote inference service backend, used only by the retry queue.
//!
//! One HTTP POST per attempt. The body carries the model's storage URI, a
//! client-generated job id, and the job inputs with every value wrapped in
//! a single-element list. The raw status and body are handed back for the
//! queue to classify; only transport failures are errors here.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::BackendError;
use crate::job_store::ModelRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceReply {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn submit(
        &self,
        model: &ModelRef,
        job_id: &str,
        inputs: &Map<String, Value>,
    ) -> Result<InferenceReply, BackendError>;
}

pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
}

impl InferenceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, model: &ModelRef) -> String {
        match &model.endpoint {
            Some(endpoint) if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {
                endpoint.clone()
            }
            Some(endpoint) => format!("{}/{}", self.base_url, endpoint.trim_start_matches('/')),
            None => format!("{}/{}", self.base_url, model.name),
        }
    }
}

/// Request body sent to the inference service.
pub fn request_body(model: &ModelRef, job_id: &str, inputs: &Map<String, Value>) -> Value {
    let wrapped: Map<String, Value> = inputs
        .iter()
        .map(|(key, value)| (key.clone(), Value::Array(vec![value.clone()])))
        .collect();
    serde_json::json!({
        "model_uri": model.storage_uri,
        "uuid": job_id,
        "inputs": wrapped,
    })
}

#[async_trait]
impl InferenceBackend for InferenceClient {
    async fn submit(
        &self,
        model: &ModelRef,
        job_id: &str,
        inputs: &Map<String, Value>,
    ) -> Result<InferenceReply, BackendError> {
        let url = self.url_for(model);
        tracing::debug!(job_id, url = %url, "submitting inference request");
        let resp = self
            .http
            .post(&url)
            .json(&request_body(model, job_id, inputs))
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(InferenceReply { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(endpoint: Option<&str>) -> ModelRef {
        ModelRef {
            name: "colabfold".into(),
            storage_uri: "s3://models/colabfold".into(),
            endpoint: endpoint.map(String::from),
        }
    }

    #[test]
    fn inputs_are_wrapped_in_single_element_lists() {
        let mut inputs = Map::new();
        inputs.insert("sequence".into(), json!("MKT"));
        inputs.insert("recycles".into(), json!(3));
        let body = request_body(&model(None), "abc-123", &inputs);
        assert_eq!(
            body,
            json!({
                "model_uri": "s3://models/colabfold",
                "uuid": "abc-123",
                "inputs": { "sequence": ["MKT"], "recycles": [3] }
            })
        );
    }

    #[test]
    fn url_prefers_model_endpoint() {
        let client = InferenceClient::new("http://ray:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url_for(&model(None)), "http://ray:8000/colabfold");
        assert_eq!(client.url_for(&model(Some("/v2/fold"))), "http://ray:8000/v2/fold");
        assert_eq!(
            client.url_for(&model(Some("https://gpu.example/fold"))),
            "https://gpu.example/fold"
        );
    }
}
