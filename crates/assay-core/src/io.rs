//! Job descriptors and the IO list format.
//!
//! An IO list is a JSON array of [`JobDescriptor`]s, one per scatter
//! combination. It is written once by expansion and rewritten by the runner
//! as each job advances through its lifecycle.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::tool::Tool;

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Error,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Error => "error",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Error | JobState::Cancelled
        )
    }

    /// Legal edges of the lifecycle graph. `Running -> Queued` is the retry
    /// edge; `Cancelled` is only reachable from `Queued` or `Running`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Error)
                | (Running, Queued)
                | (Queued, Cancelled)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "error" => Ok(JobState::Error),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

// ── Slot values ───────────────────────────────────────────────────────────────

/// Resolved value of one input or output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum SlotValue {
    /// A file reference. An empty `filepath` is an unresolved output.
    File {
        #[serde(default)]
        filepath: String,
    },
    Scalar { value: serde_json::Value },
}

impl SlotValue {
    pub fn file(path: impl Into<String>) -> Self {
        SlotValue::File { filepath: path.into() }
    }

    pub fn unresolved_file() -> Self {
        SlotValue::File { filepath: String::new() }
    }

    pub fn scalar(value: serde_json::Value) -> Self {
        SlotValue::Scalar { value }
    }

    /// Resolved path for a File value. `None` for scalars and unresolved files.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            SlotValue::File { filepath } if !filepath.is_empty() => Some(filepath),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, SlotValue::File { .. })
    }
}

// ── Descriptor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub cid: String,
}

impl ToolInfo {
    pub fn of(tool: &Tool) -> Self {
        Self {
            name: tool.name.clone(),
            cid: tool.content_id(),
        }
    }
}

/// One concrete unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub tool: ToolInfo,
    pub inputs: IndexMap<String, SlotValue>,
    pub outputs: IndexMap<String, SlotValue>,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_job_id: Option<String>,
}

impl JobDescriptor {
    pub fn new(
        tool: ToolInfo,
        inputs: IndexMap<String, SlotValue>,
        outputs: IndexMap<String, SlotValue>,
    ) -> Self {
        Self {
            tool,
            inputs,
            outputs,
            state: JobState::Created,
            err_msg: None,
            user_id: None,
            backend_job_id: None,
        }
    }

    /// Move to `next`, rejecting edges outside the lifecycle graph.
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// A fresh descriptor for the same inputs. Terminal descriptors are
    /// never moved back; a retry supersedes them with a new `Created` one.
    pub fn superseding(&self) -> Self {
        let outputs = self
            .outputs
            .iter()
            .map(|(name, value)| {
                let reset = if value.is_file() {
                    SlotValue::unresolved_file()
                } else {
                    value.clone()
                };
                (name.clone(), reset)
            })
            .collect();
        Self {
            tool: self.tool.clone(),
            inputs: self.inputs.clone(),
            outputs,
            state: JobState::Created,
            err_msg: None,
            user_id: self.user_id.clone(),
            backend_job_id: None,
        }
    }
}

// ── IO list files ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum IoListError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(serde_json::Error),
}

pub fn read_io_list(path: &Path) -> Result<Vec<JobDescriptor>, IoListError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| IoListError::ReadFailed(path.to_path_buf(), e))?;
    serde_json::from_str(&text).map_err(|e| IoListError::ParseFailed(path.to_path_buf(), e))
}

/// Write an IO list as indented JSON, replacing the file atomically.
pub fn write_io_list(path: &Path, list: &[JobDescriptor]) -> Result<(), IoListError> {
    let text = serde_json::to_string_pretty(list).map_err(IoListError::SerializeFailed)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| IoListError::WriteFailed(path.to_path_buf(), e))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text).map_err(|e| IoListError::WriteFailed(tmp.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| IoListError::WriteFailed(path.to_path_buf(), e))
}
