//! Test list loading.
//!
//! The test list is a YAML file naming each test script, the head files it
//! needs, any extra harness flags and preferences set for that test only:
//!
//! ```yaml
//! tests:
//!   - path: dom/test_storage.js
//!     head: head_storage.js head_common.js
//!   - path: netwerk/unit/test_http2.js
//!     flags: ["-e", "const _HTTP2 = true;"]
//!     prefs: ["network.http.http2.enabled=true"]
//! ```
//!
//! Relative paths are resolved against the directory containing the list.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestManifest {
    #[serde(default)]
    pub tests: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Test script, relative to the manifest or absolute
    pub path: PathBuf,

    /// Space-separated head files, relative to the test's directory
    #[serde(default)]
    pub head: String,

    /// Extra arguments passed to the harness for this test
    #[serde(default)]
    pub flags: Vec<String>,

    /// `name=value` preferences applied on top of the shared ones
    #[serde(default)]
    pub prefs: Vec<String>,
}

/// A single test ready to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDescriptor {
    pub name: String,
    /// Local path of the test script
    pub path: PathBuf,
    /// Local directory the test lives in
    pub here: PathBuf,
    pub head_files: Vec<String>,
    pub flags: Vec<String>,
    pub prefs: Vec<(String, String)>,
}

impl TestDescriptor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let here = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path,
            here,
            head_files: Vec::new(),
            flags: Vec::new(),
            prefs: Vec::new(),
        }
    }

    pub fn with_head(mut self, head: &str) -> Self {
        self.head_files = split_head(head);
        self
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_prefs(mut self, prefs: Vec<(String, String)>) -> Self {
        self.prefs = prefs;
        self
    }
}

impl TestManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read test list {}: {}", path.display(), e),
            ))
        })?;
        let manifest: TestManifest = serde_yaml::from_str(&contents).map_err(|e| {
            Error::Config(format!("Failed to parse test list {}: {}", path.display(), e))
        })?;
        Ok(manifest)
    }

    /// Builds descriptors, resolving relative paths against `base_dir` and
    /// keeping only tests whose path contains one of `filters` (all tests if
    /// `filters` is empty).
    pub fn descriptors(&self, base_dir: &Path, filters: &[String]) -> Result<Vec<TestDescriptor>> {
        let mut tests = Vec::new();
        for entry in &self.tests {
            let path = if entry.path.is_absolute() {
                entry.path.clone()
            } else {
                base_dir.join(&entry.path)
            };
            let selected = filters.is_empty()
                || filters
                    .iter()
                    .any(|f| path.to_string_lossy().contains(f.as_str()));
            if !selected {
                continue;
            }
            let prefs = entry
                .prefs
                .iter()
                .map(|pref| split_pref(pref, &path))
                .collect::<Result<Vec<_>>>()?;
            tests.push(
                TestDescriptor::new(path)
                    .with_head(&entry.head)
                    .with_flags(entry.flags.clone())
                    .with_prefs(prefs),
            );
        }
        Ok(tests)
    }
}

/// Loads a test list and builds its descriptors.
pub fn load_tests(manifest_path: &Path, filters: &[String]) -> Result<Vec<TestDescriptor>> {
    let manifest = TestManifest::load(manifest_path)?;
    let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    manifest.descriptors(base_dir, filters)
}

fn split_head(head: &str) -> Vec<String> {
    head.split_whitespace().map(str::to_string).collect()
}

fn split_pref(pref: &str, test: &Path) -> Result<(String, String)> {
    match pref.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(Error::Config(format!(
            "Invalid pref '{}' for {}, expected name=value",
            pref,
            test.display()
        ))),
    }
}
