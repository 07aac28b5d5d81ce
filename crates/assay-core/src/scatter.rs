//! Scatter expansion: one job descriptor per combination of matched files.

use indexmap::IndexMap;
use std::path::Path;

use crate::io::{JobDescriptor, SlotValue, ToolInfo};
use crate::matcher::{self, PathError, SlotMatches};
use crate::tool::Tool;

/// Result of expanding a tool against an input directory.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub descriptors: Vec<JobDescriptor>,
    /// File slots that matched nothing. Non-empty means `descriptors` is
    /// empty; callers report this separately from a matching error.
    pub empty_slots: Vec<String>,
}

/// Cartesian product of the matched files across File slots.
///
/// The first slot varies slowest. Inputs hold absolute file paths; non-File
/// slots with a default are carried as scalars. File outputs start as
/// unresolved placeholders. A tool with no File inputs yields exactly one
/// descriptor.
pub fn expand(tool: &Tool, matches: &SlotMatches) -> Vec<JobDescriptor> {
    let info = ToolInfo::of(tool);

    let mut combos: Vec<IndexMap<String, SlotValue>> = vec![IndexMap::new()];
    for (slot, files) in &matches.slots {
        let mut next = Vec::with_capacity(combos.len() * files.len());
        for combo in &combos {
            for file in files {
                let mut extended = combo.clone();
                let path = matches.resolve(file);
                extended.insert(slot.clone(), SlotValue::file(path.to_string_lossy()));
                next.push(extended);
            }
        }
        combos = next;
    }

    let scalars: Vec<(String, SlotValue)> = tool
        .inputs
        .iter()
        .filter(|(_, input)| !input.is_file())
        .filter_map(|(slot, input)| {
            input
                .default
                .clone()
                .map(|value| (slot.clone(), SlotValue::scalar(value)))
        })
        .collect();

    let outputs: IndexMap<String, SlotValue> = tool
        .outputs
        .iter()
        .filter(|(_, output)| output.is_file())
        .map(|(slot, _)| (slot.clone(), SlotValue::unresolved_file()))
        .collect();

    combos
        .into_iter()
        .map(|mut inputs| {
            inputs.extend(scalars.iter().cloned());
            JobDescriptor::new(info.clone(), inputs, outputs.clone())
        })
        .collect()
}

/// Match then expand.
pub fn expand_dir(input_dir: &Path, tool: &Tool) -> Result<Expansion, PathError> {
    let matches = matcher::find_matching_files(input_dir, tool)?;
    let empty_slots: Vec<String> = matches.empty_slots().into_iter().map(String::from).collect();
    let descriptors = expand(tool, &matches);
    if !empty_slots.is_empty() {
        tracing::warn!(
            tool = %tool.name,
            slots = ?empty_slots,
            "no files matched, nothing to run"
        );
    } else {
        tracing::info!(tool = %tool.name, jobs = descriptors.len(), "expanded scatter");
    }
    Ok(Expansion {
        descriptors,
        empty_slots,
    })
}
