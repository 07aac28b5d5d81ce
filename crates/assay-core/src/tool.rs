//! Tool model: the declarative description of one containerised program.
//!
//! A tool names a container image, the command to run inside it, and the
//! typed input/output slots the command refers to through `$(inputs.*)`
//! placeholders. Tools are loaded once and never mutated.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hash;

/// Slot type for inputs and outputs backed by a file.
pub const FILE_TYPE: &str = "File";

/// One input slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub glob: Vec<String>,
    /// Scalar default. Used for non-File slots and `$(inputs.x.default)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ToolInput {
    pub fn is_file(&self) -> bool {
        self.kind == FILE_TYPE
    }
}

/// One output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(default)]
    pub glob: Vec<String>,
}

impl ToolOutput {
    pub fn is_file(&self) -> bool {
        self.kind == FILE_TYPE
    }
}

/// Tool specification.
///
/// `inputs` and `outputs` keep document order; scatter enumerates slots in
/// the order they first appear in the tool file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_command: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(rename = "dockerPull")]
    pub image: String,
    #[serde(default)]
    pub gpu_bool: bool,
    #[serde(default, rename = "memoryGB")]
    pub memory_gb: Option<u32>,
    #[serde(default)]
    pub network_bool: bool,
    #[serde(default)]
    pub inputs: IndexMap<String, ToolInput>,
    #[serde(default)]
    pub outputs: IndexMap<String, ToolOutput>,
}

/// Resource hints passed through to execution backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceHints {
    pub gpu: bool,
    pub memory_gb: Option<u32>,
    pub network: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse tool {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("invalid tool {name:?}: {reason}")]
    Invalid { name: String, reason: String },
}

impl Tool {
    /// Read and validate a tool file.
    pub fn from_path(path: &Path) -> Result<Self, ToolError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ToolError::ReadFailed(path.to_path_buf(), e))?;
        let tool: Tool = serde_json::from_str(&text)
            .map_err(|e| ToolError::ParseFailed(path.to_path_buf(), e))?;
        tool.validate()?;
        Ok(tool)
    }

    pub fn validate(&self) -> Result<(), ToolError> {
        let invalid = |reason: &str| ToolError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.base_command.is_empty() {
            return Err(invalid("baseCommand is empty"));
        }
        if self.image.trim().is_empty() {
            return Err(invalid("dockerPull is empty"));
        }
        for (slot, input) in &self.inputs {
            if input.is_file() && input.glob.is_empty() {
                return Err(invalid(&format!("File input {slot} has no glob patterns")));
            }
        }
        Ok(())
    }

    pub fn hints(&self) -> ResourceHints {
        ResourceHints {
            gpu: self.gpu_bool,
            memory_gb: self.memory_gb.filter(|gb| *gb > 0),
            network: self.network_bool,
        }
    }

    /// Content identifier of the tool: BLAKE3 over its canonical JSON.
    pub fn content_id(&self) -> String {
        // Serialising a Tool cannot fail: every field is a string, bool,
        // integer, JSON value or string-keyed map of those.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hash::content_id(&bytes)
    }

    /// Names of input slots of type File, in document order.
    pub fn file_inputs(&self) -> impl Iterator<Item = (&String, &ToolInput)> {
        self.inputs.iter().filter(|(_, input)| input.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKING_TOOL: &str = r#"{
        "name": "docking",
        "description": "Docking of small molecules to a protein",
        "baseCommand": ["/bin/bash", "-c"],
        "arguments": [
            "python main.py --protein $(inputs.protein.filepath) --ligand $(inputs.small_molecule.filepath);",
            "mv /outputs/out.sdf /outputs/$(inputs.protein.basename)_docked.$(inputs.small_molecule.ext);"
        ],
        "dockerPull": "ghcr.io/example/docking:latest",
        "gpuBool": false,
        "networkBool": false,
        "inputs": {
            "small_molecule": { "type": "File", "glob": ["*.sdf", "*.mol2"] },
            "protein": { "type": "File", "glob": ["*.pdb"] },
            "exhaustiveness": { "type": "int", "default": 8 }
        },
        "outputs": {
            "docked": { "type": "File", "glob": ["*_docked.sdf"] }
        }
    }"#;

    #[test]
    fn parses_tool_and_keeps_slot_order() {
        let tool: Tool = serde_json::from_str(DOCKING_TOOL).unwrap();
        assert_eq!(tool.name, "docking");
        assert_eq!(tool.base_command, vec!["/bin/bash", "-c"]);
        assert_eq!(tool.image, "ghcr.io/example/docking:latest");
        assert_eq!(tool.memory_gb, None);

        let names: Vec<&str> = tool.inputs.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["small_molecule", "protein", "exhaustiveness"]);

        let files: Vec<&str> = tool.file_inputs().map(|(k, _)| k.as_str()).collect();
        assert_eq!(files, vec!["small_molecule", "protein"]);
        assert_eq!(tool.inputs["exhaustiveness"].default, Some(serde_json::json!(8)));
        tool.validate().unwrap();
    }

    #[test]
    fn hints_ignore_zero_memory() {
        let mut tool: Tool = serde_json::from_str(DOCKING_TOOL).unwrap();
        tool.memory_gb = Some(0);
        tool.gpu_bool = true;
        let hints = tool.hints();
        assert!(hints.gpu);
        assert_eq!(hints.memory_gb, None);

        tool.memory_gb = Some(12);
        assert_eq!(tool.hints().memory_gb, Some(12));
    }

    #[test]
    fn content_id_changes_with_content() {
        let tool: Tool = serde_json::from_str(DOCKING_TOOL).unwrap();
        let mut other = tool.clone();
        assert_eq!(tool.content_id(), other.content_id());
        other.image = "ghcr.io/example/docking:v2".into();
        assert_ne!(tool.content_id(), other.content_id());
    }

    #[test]
    fn validate_rejects_file_slot_without_globs() {
        let mut tool: Tool = serde_json::from_str(DOCKING_TOOL).unwrap();
        tool.inputs.get_mut("protein").unwrap().glob.clear();
        assert!(matches!(tool.validate(), Err(ToolError::Invalid { .. })));
    }

    #[test]
    fn from_path_reports_missing_file() {
        let err = Tool::from_path(Path::new("/nonexistent/tool.json")).unwrap_err();
        assert!(matches!(err, ToolError::ReadFailed(..)));
    }
}
