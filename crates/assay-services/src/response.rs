//! Inference service response parsing.
//!
//! A response is an arbitrarily nested JSON object, optionally wrapped in a
//! top-level `"response"` key. `"uuid"` and the primary output key are
//! pulled out directly; every other value is walked recursively and each
//! leaf classified on its own:
//!
//! - number → score, named by its dotted/bracketed path
//! - object carrying a string `"uri"` → file entry at that path
//! - anything else → ignored
//!
//! Missing optional fields never fail the parse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDetail {
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub uuid: Option<String>,
    pub primary: Option<FileDetail>,
    pub files: BTreeMap<String, FileDetail>,
    pub scores: BTreeMap<String, f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response is not a JSON object")]
    NotAnObject,
}

/// How one value in the response tree is treated.
#[derive(Debug, Clone, PartialEq)]
pub enum Leaf<'a> {
    Score(f64),
    File(FileDetail),
    Nested(&'a Map<String, Value>),
    List(&'a [Value]),
    Ignored,
}

/// Classify a single value without looking at its children.
pub fn classify(value: &Value) -> Leaf<'_> {
    match value {
        Value::Number(n) => n.as_f64().map(Leaf::Score).unwrap_or(Leaf::Ignored),
        Value::Object(map) => match map.get("uri").and_then(Value::as_str) {
            Some(uri) => Leaf::File(FileDetail {
                uri: uri.to_string(),
            }),
            None => Leaf::Nested(map),
        },
        Value::Array(items) => Leaf::List(items),
        _ => Leaf::Ignored,
    }
}

pub fn parse(body: &str, primary_key: &str) -> Result<InferenceResponse, ResponseError> {
    let raw: Value = serde_json::from_str(body)?;
    let root = match &raw {
        Value::Object(map) => match map.get("response") {
            Some(Value::Object(inner)) => inner,
            _ => map,
        },
        _ => return Err(ResponseError::NotAnObject),
    };

    let mut parsed = InferenceResponse {
        uuid: root.get("uuid").and_then(Value::as_str).map(String::from),
        primary: root.get(primary_key).and_then(|v| match classify(v) {
            Leaf::File(detail) => Some(detail),
            _ => None,
        }),
        ..InferenceResponse::default()
    };

    for (key, value) in root {
        if key == "uuid" || key == primary_key {
            continue;
        }
        visit(key.clone(), value, &mut parsed);
    }
    Ok(parsed)
}

fn visit(path: String, value: &Value, out: &mut InferenceResponse) {
    match classify(value) {
        Leaf::Score(score) => {
            out.scores.insert(path, score);
        }
        Leaf::File(detail) => {
            out.files.insert(path, detail);
        }
        Leaf::Nested(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                visit(child_path, child, out);
            }
        }
        Leaf::List(items) => {
            for (i, item) in items.iter().enumerate() {
                visit(format!("{path}[{i}]"), item, out);
            }
        }
        Leaf::Ignored => {}
    }
}

impl InferenceResponse {
    /// Indented JSON summary: `{uuid, primary, files, scores}`.
    pub fn pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}
