//! Translation between local test directories and their remote mirrors.

use crate::device::remote_join;
use log::debug;
use std::path::{Component, Path, PathBuf};

/// A local test-source directory and where it lives on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub local: PathBuf,
    pub remote: String,
}

/// Registry of local-to-remote directory mappings.
#[derive(Debug, Default, Clone)]
pub struct PathTranslator {
    mappings: Vec<PathMapping>,
}

impl PathTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mapping. Returns false if `local_dir` is already mapped;
    /// the first registration stays in effect.
    pub fn register(&mut self, local_dir: &Path, remote_dir: &str) -> bool {
        let local = normalize(local_dir);
        if self.mappings.iter().any(|m| m.local == local) {
            return false;
        }
        debug!("Mapping {} -> {}", local.display(), remote_dir);
        self.mappings.push(PathMapping {
            local,
            remote: remote_dir.trim_end_matches('/').to_string(),
        });
        true
    }

    pub fn mappings(&self) -> &[PathMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Maps a directory to its remote mirror.
    ///
    /// The nearest registered ancestor (the directory itself included) wins
    /// and the remaining suffix is appended. Unmapped directories come back
    /// unchanged.
    pub fn resolve_dir(&self, local_dir: &Path) -> String {
        self.lookup(local_dir)
            .unwrap_or_else(|| to_posix(local_dir))
    }

    /// Maps a file path through the mapping of its containing directory.
    ///
    /// The containing directory does not need a mapping of its own: like
    /// `resolve_dir`, this falls back to the nearest registered ancestor
    /// rather than requiring an exact directory match, so scripts in
    /// subdirectories of a mapped tree still resolve.
    pub fn resolve(&self, local_path: &Path) -> String {
        let remote = match (local_path.parent(), local_path.file_name()) {
            (Some(parent), Some(name)) => self
                .lookup(parent)
                .map(|dir| remote_join(&dir, &name.to_string_lossy())),
            _ => None,
        };
        remote.unwrap_or_else(|| to_posix(local_path))
    }

    fn lookup(&self, local_dir: &Path) -> Option<String> {
        let dir = normalize(local_dir);
        dir.ancestors().find_map(|ancestor| {
            let mapping = self.mappings.iter().find(|m| m.local == ancestor)?;
            let suffix = dir.strip_prefix(ancestor).map(to_posix).unwrap_or_default();
            Some(remote_join(&mapping.remote, &suffix))
        })
    }
}

/// Lexically normalizes a path: drops `.` and folds `..` without touching
/// the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Renders a local path with forward slashes.
fn to_posix(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
