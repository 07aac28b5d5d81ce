//! Input matcher: finds the files in an input directory that each File slot
//! of a tool accepts.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};

use crate::tool::Tool;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("input directory {0} is unreadable: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("slot {slot}: malformed glob {pattern:?}: {source}")]
    Pattern {
        slot: String,
        pattern: String,
        source: glob::PatternError,
    },
    #[error("glob scan failed: {0}")]
    Glob(#[from] glob::GlobError),
}

/// Matched files per File slot, relative to the input directory.
///
/// Slots appear in tool order. Within a slot, files are in the order the
/// glob scan returned them (sorted per pattern, patterns in declared order)
/// with duplicates removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotMatches {
    pub root: PathBuf,
    pub slots: IndexMap<String, Vec<PathBuf>>,
}

impl SlotMatches {
    /// Slots with no matching file. Any such slot empties the scatter product.
    pub fn empty_slots(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|(_, files)| files.is_empty())
            .map(|(slot, _)| slot.as_str())
            .collect()
    }

    /// Absolute path of a matched file.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }
}

pub fn find_matching_files(input_dir: &Path, tool: &Tool) -> Result<SlotMatches, PathError> {
    std::fs::read_dir(input_dir).map_err(|e| PathError::Unreadable(input_dir.to_path_buf(), e))?;

    let root_str = input_dir.to_string_lossy();
    let escaped_root = glob::Pattern::escape(&root_str);

    let mut slots = IndexMap::new();
    for (slot, input) in tool.file_inputs() {
        let mut files: Vec<PathBuf> = Vec::new();
        for pattern in &input.glob {
            let bad_pattern = |source| PathError::Pattern {
                slot: slot.clone(),
                pattern: pattern.clone(),
                source,
            };
            glob::Pattern::new(pattern).map_err(bad_pattern)?;

            let full = Path::new(&escaped_root).join(pattern);
            let paths = glob::glob(&full.to_string_lossy()).map_err(bad_pattern)?;
            for entry in paths {
                let path = entry?;
                if !path.is_file() {
                    continue;
                }
                let relative = path
                    .strip_prefix(input_dir)
                    .map(Path::to_path_buf)
                    .unwrap_or(path);
                if !files.contains(&relative) {
                    files.push(relative);
                }
            }
        }
        tracing::debug!(slot = %slot, matched = files.len(), "matched input files");
        slots.insert(slot.clone(), files);
    }

    Ok(SlotMatches {
        root: input_dir.to_path_buf(),
        slots,
    })
}
