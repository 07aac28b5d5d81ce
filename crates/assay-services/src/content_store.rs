//! Content-addressed storage for job inputs and outputs.
//!
//! Blobs live in a two-level directory keyed by their BLAKE3 digest:
//!   {root}/{cid[0..2]}/{cid}
//!
//! Pinning a directory stores every file as a blob plus a JSON manifest
//! mapping relative paths to blob ids. The manifest is itself a blob, and
//! its id is the directory's CID. Blobs are immutable; writing an existing
//! one is a no-op.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use assay_core::hash;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("content {0} not found")]
    NotFound(String),
    #[error("content {cid} is corrupt: {reason}")]
    Corrupt { cid: String, reason: String },
    #[error("manifest entry escapes the target directory: {0}")]
    UnsafePath(String),
}

fn io_err(context: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> ContentStoreError {
    let path = path.to_path_buf();
    move |source| ContentStoreError::Io {
        context,
        path,
        source,
    }
}

/// Pin and fetch directories by content identifier.
pub trait ContentStore: Send + Sync {
    /// Store every file under `dir`; returns the directory CID.
    fn pin_dir(&self, dir: &Path) -> Result<String, ContentStoreError>;
    /// CID `pin_dir` would return, without storing anything.
    fn cid_of(&self, dir: &Path) -> Result<String, ContentStoreError>;
    /// Materialise a pinned directory under `dest`.
    fn fetch(&self, cid: &str, dest: &Path) -> Result<(), ContentStoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    path: String,
    blob: String,
    size: u64,
}

/// Blob store on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ContentStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err("failed to create store root", &root))?;
        Ok(Self { root })
    }

    pub fn has(&self, cid: &str) -> bool {
        hash::is_content_id(cid) && self.blob_path(cid).exists()
    }

    /// Store `data`, returning its CID.
    pub fn put(&self, data: &[u8]) -> Result<String, ContentStoreError> {
        let cid = hash::content_id(data);
        let path = self.blob_path(&cid);
        if path.exists() {
            return Ok(cid);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("failed to create blob dir", parent))?;
        }

        let tmp_path = path.with_extension("tmp");
        {
            let mut file =
                fs::File::create(&tmp_path).map_err(io_err("failed to create", &tmp_path))?;
            file.write_all(data).map_err(io_err("failed to write", &tmp_path))?;
            file.sync_all().map_err(io_err("failed to sync", &tmp_path))?;
        }
        fs::rename(&tmp_path, &path).map_err(io_err("failed to rename", &tmp_path))?;

        tracing::trace!(cid = %cid, bytes = data.len(), "blob stored");
        Ok(cid)
    }

    pub fn get(&self, cid: &str) -> Result<Vec<u8>, ContentStoreError> {
        if !self.has(cid) {
            return Err(ContentStoreError::NotFound(cid.to_string()));
        }
        let path = self.blob_path(cid);
        let file = fs::File::open(&path).map_err(io_err("failed to open", &path))?;
        let len = file.metadata().map_err(io_err("failed to stat", &path))?.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        // Safety: blobs are never modified after the rename that publishes them.
        let mmap = unsafe { Mmap::map(&file).map_err(io_err("failed to mmap", &path))? };
        Ok(mmap.to_vec())
    }

    /// Number of stored blobs, manifests included.
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.count();
                }
            }
        }
        total
    }

    fn blob_path(&self, cid: &str) -> PathBuf {
        self.root.join(&cid[0..2]).join(cid)
    }

    fn manifest(&self, dir: &Path, store: bool) -> Result<String, ContentStoreError> {
        let mut files = Vec::new();
        collect_files(dir, &mut files)?;
        files.sort();

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let data = fs::read(&file).map_err(io_err("failed to read", &file))?;
            let blob = if store {
                self.put(&data)?
            } else {
                hash::content_id(&data)
            };
            let relative = file.strip_prefix(dir).unwrap_or(&file);
            entries.push(ManifestEntry {
                path: relative.to_string_lossy().into_owned(),
                blob,
                size: data.len() as u64,
            });
        }

        let bytes = serde_json::to_vec(&entries).map_err(|e| ContentStoreError::Corrupt {
            cid: String::new(),
            reason: e.to_string(),
        })?;
        if store {
            self.put(&bytes)
        } else {
            Ok(hash::content_id(&bytes))
        }
    }
}

impl ContentStore for LocalContentStore {
    fn pin_dir(&self, dir: &Path) -> Result<String, ContentStoreError> {
        let cid = self.manifest(dir, true)?;
        tracing::debug!(dir = %dir.display(), cid = %cid, "directory pinned");
        Ok(cid)
    }

    fn cid_of(&self, dir: &Path) -> Result<String, ContentStoreError> {
        self.manifest(dir, false)
    }

    fn fetch(&self, cid: &str, dest: &Path) -> Result<(), ContentStoreError> {
        let raw = self.get(cid)?;
        let entries: Vec<ManifestEntry> =
            serde_json::from_slice(&raw).map_err(|e| ContentStoreError::Corrupt {
                cid: cid.to_string(),
                reason: e.to_string(),
            })?;

        for entry in entries {
            let relative = Path::new(&entry.path);
            if !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            {
                return Err(ContentStoreError::UnsafePath(entry.path));
            }
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
            }
            let data = self.get(&entry.blob)?;
            fs::write(&target, data).map_err(io_err("failed to write", &target))?;
        }
        tracing::debug!(cid = %cid, dest = %dest.display(), "content fetched");
        Ok(())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ContentStoreError> {
    for entry in fs::read_dir(dir).map_err(io_err("failed to list", dir))? {
        let entry = entry.map_err(io_err("failed to list", dir))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}
