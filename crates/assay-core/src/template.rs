//! Command templating.
//!
//! A tool's argument tokens are joined with single spaces and every
//! `$(inputs.<slot>.<field>)` placeholder is substituted against one job
//! descriptor. Fields:
//!
//! - `filepath`: `<mount>/<file name>` of the job's resolved input
//! - `basename`: file name without its extension
//! - `ext`: extension without the leading dot
//! - `default`: the tool's declared default for the slot
//!
//! A second pass replaces bare `$(inputs.<slot>)` placeholders of non-File
//! slots with their scalar value. Rendering is a pure function of
//! (tool, job, mount).

use regex::{Captures, Regex};
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use crate::io::{JobDescriptor, SlotValue};
use crate::tool::Tool;

static FIELD_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\(inputs\.([^()\s]+?)\.(filepath|basename|ext|default)\)")
        .unwrap_or_else(|e| panic!("invalid placeholder regex: {e}"))
});

static BARE_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\(inputs\.([^()\s]+)\)")
        .unwrap_or_else(|e| panic!("invalid placeholder regex: {e}"))
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("placeholder references unknown input slot {0:?}")]
    UnknownSlot(String),
    #[error("File input {0:?} has no resolved path")]
    UnresolvedFile(String),
    #[error("input {slot:?} is not a File but is used as .{field}")]
    NotAFile { slot: String, field: String },
    #[error("input {0:?} has no default value")]
    MissingDefault(String),
}

/// A rendered command: base tokens plus one substituted argument string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub base_command: Vec<String>,
    pub arguments: String,
}

impl Invocation {
    /// Process argv as executed: base tokens, then the argument string as a
    /// single trailing argument.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.base_command.clone();
        if !self.arguments.is_empty() {
            argv.push(self.arguments.clone());
        }
        argv
    }
}

impl fmt::Display for Invocation {
    /// Shell form: `bash -c "cmd /inputs/a.pdb"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base: Vec<String> = self.base_command.iter().map(|t| quote(t)).collect();
        write!(f, "{}", base.join(" "))?;
        if !self.arguments.is_empty() {
            write!(f, " \"{}\"", escape_double_quoted(&self.arguments))?;
        }
        Ok(())
    }
}

/// Quote one token for a POSIX shell. Plain tokens pass through unchanged.
pub fn quote(token: &str) -> String {
    let plain = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@,+%".contains(c));
    if plain {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

fn escape_double_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render `job` against `tool` with File inputs mounted under `mount`.
pub fn render(tool: &Tool, job: &JobDescriptor, mount: &str) -> Result<Invocation, TemplateError> {
    let joined = tool.arguments.join(" ");

    let first = replace_all(&FIELD_PLACEHOLDER, &joined, |caps| {
        resolve_field(tool, job, mount, &caps[1], &caps[2])
    })?;
    let arguments = replace_all(&BARE_PLACEHOLDER, &first, |caps| {
        resolve_bare(tool, job, &caps[1])
    })?;

    Ok(Invocation {
        base_command: tool.base_command.clone(),
        arguments,
    })
}

fn replace_all(
    re: &Regex,
    text: &str,
    mut resolve: impl FnMut(&Captures<'_>) -> Result<String, TemplateError>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        out.push_str(&resolve(&caps)?);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

fn resolve_field(
    tool: &Tool,
    job: &JobDescriptor,
    mount: &str,
    slot: &str,
    field: &str,
) -> Result<String, TemplateError> {
    let input = tool
        .inputs
        .get(slot)
        .ok_or_else(|| TemplateError::UnknownSlot(slot.to_string()))?;

    if field == "default" {
        return input
            .default
            .as_ref()
            .map(scalar_text)
            .ok_or_else(|| TemplateError::MissingDefault(slot.to_string()));
    }

    let path = match job.inputs.get(slot) {
        Some(SlotValue::Scalar { .. }) => {
            return Err(TemplateError::NotAFile {
                slot: slot.to_string(),
                field: field.to_string(),
            })
        }
        Some(value) => value.file_path(),
        None => None,
    };
    let path = Path::new(path.ok_or_else(|| TemplateError::UnresolvedFile(slot.to_string()))?);

    let text = match field {
        "filepath" => {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            format!("{}/{}", mount.trim_end_matches('/'), name)
        }
        "basename" => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        _ => path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    Ok(text)
}

fn resolve_bare(tool: &Tool, job: &JobDescriptor, slot: &str) -> Result<String, TemplateError> {
    let input = tool
        .inputs
        .get(slot)
        .ok_or_else(|| TemplateError::UnknownSlot(slot.to_string()))?;
    if input.is_file() {
        return Err(TemplateError::UnresolvedFile(slot.to_string()));
    }
    match job.inputs.get(slot) {
        Some(SlotValue::Scalar { value }) => Ok(scalar_text(value)),
        _ => input
            .default
            .as_ref()
            .map(scalar_text)
            .ok_or_else(|| TemplateError::MissingDefault(slot.to_string())),
    }
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ToolInfo;
    use indexmap::IndexMap;
    use serde_json::json;

    fn tool(arguments: &[&str]) -> Tool {
        serde_json::from_value(json!({
            "name": "dock",
            "baseCommand": ["bash", "-c"],
            "arguments": arguments,
            "dockerPull": "img",
            "inputs": {
                "protein": { "type": "File", "glob": ["*.pdb"] },
                "ligand": { "type": "File", "glob": ["*.sdf"] },
                "exhaustiveness": { "type": "int", "default": 8 },
                "mode": { "type": "string", "default": "fast" }
            }
        }))
        .unwrap()
    }

    fn job(tool: &Tool) -> JobDescriptor {
        let mut inputs = IndexMap::new();
        inputs.insert("protein".into(), SlotValue::file("/data/run/7n9g.pdb"));
        inputs.insert("ligand".into(), SlotValue::file("/data/run/aspirin.sdf"));
        inputs.insert("exhaustiveness".into(), SlotValue::scalar(json!(8)));
        JobDescriptor::new(ToolInfo::of(tool), inputs, IndexMap::new())
    }

    #[test]
    fn renders_filepath_under_mount() {
        let tool = tool(&["cmd $(inputs.protein.filepath)"]);
        let inv = render(&tool, &job(&tool), "/inputs").unwrap();
        assert_eq!(inv.arguments, "cmd /inputs/7n9g.pdb");
        assert_eq!(inv.argv(), vec!["bash", "-c", "cmd /inputs/7n9g.pdb"]);
        assert_eq!(inv.to_string(), r#"bash -c "cmd /inputs/7n9g.pdb""#);
    }

    #[test]
    fn renders_every_field_kind() {
        let tool = tool(&[
            "dock $(inputs.protein.filepath) $(inputs.ligand.filepath)",
            "--out $(inputs.protein.basename)_$(inputs.ligand.basename).$(inputs.ligand.ext)",
            "--ex $(inputs.exhaustiveness.default) --mode $(inputs.mode)",
        ]);
        let inv = render(&tool, &job(&tool), "/mnt/in/").unwrap();
        assert_eq!(
            inv.arguments,
            "dock /mnt/in/7n9g.pdb /mnt/in/aspirin.sdf --out 7n9g_aspirin.sdf --ex 8 --mode fast"
        );
    }

    #[test]
    fn rendering_is_pure() {
        let tool = tool(&["x $(inputs.protein.filepath) $(inputs.exhaustiveness)"]);
        let job = job(&tool);
        let a = render(&tool, &job, "/inputs").unwrap();
        let b = render(&tool, &job, "/inputs").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.arguments, "x /inputs/7n9g.pdb 8");
    }

    #[test]
    fn unknown_slot_fails() {
        let tool = tool(&["x $(inputs.receptor.filepath)"]);
        let err = render(&tool, &job(&tool), "/inputs").unwrap_err();
        assert_eq!(err, TemplateError::UnknownSlot("receptor".into()));

        let tool = super::tests::tool(&["x $(inputs.nope)"]);
        let err = render(&tool, &job(&tool), "/inputs").unwrap_err();
        assert_eq!(err, TemplateError::UnknownSlot("nope".into()));
    }

    #[test]
    fn unresolved_file_fails_loudly() {
        let tool = tool(&["x $(inputs.protein.filepath)"]);
        let mut job = job(&tool);
        job.inputs.insert("protein".into(), SlotValue::unresolved_file());
        let err = render(&tool, &job, "/inputs").unwrap_err();
        assert_eq!(err, TemplateError::UnresolvedFile("protein".into()));

        let tool = super::tests::tool(&["x $(inputs.protein)"]);
        let err = render(&tool, &super::tests::job(&tool), "/inputs").unwrap_err();
        assert_eq!(err, TemplateError::UnresolvedFile("protein".into()));
    }

    #[test]
    fn scalar_used_as_file_fails() {
        let tool = tool(&["x $(inputs.exhaustiveness.filepath)"]);
        let err = render(&tool, &job(&tool), "/inputs").unwrap_err();
        assert!(matches!(err, TemplateError::NotAFile { .. }));
    }

    #[test]
    fn shell_form_escapes_arguments() {
        let inv = Invocation {
            base_command: vec!["/bin/bash".into(), "-c".into()],
            arguments: r#"echo "$HOME" `id` \n"#.into(),
        };
        assert_eq!(inv.to_string(), r#"/bin/bash -c "echo \"\$HOME\" \`id\` \\n""#);
        assert_eq!(quote("plain-token_1.txt"), "plain-token_1.txt");
        assert_eq!(quote("it's here"), r"'it'\''s here'");
        assert_eq!(quote(""), "''");
    }
}
