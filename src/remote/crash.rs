//! Crash-dump analysis for pulled minidumps.

use crate::error::Result;
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// What a crash check found.
#[derive(Debug, Default, Clone)]
pub struct CrashReport {
    /// Minidump files found in the pulled directory
    pub dumps: Vec<PathBuf>,
    /// Symbolicated stack for each dump, when a stackwalker was available
    pub stacks: Vec<String>,
}

impl CrashReport {
    pub fn crashed(&self) -> bool {
        !self.dumps.is_empty()
    }
}

/// Analyzes a directory of minidumps.
pub trait CrashAnalyzer {
    fn analyze(&self, dump_dir: &Path, symbols_path: Option<&Path>, test_name: &str) -> Result<CrashReport>;
}

/// Finds `*.dmp` files and, if configured, runs `minidump-stackwalk` on them.
#[derive(Debug, Default, Clone)]
pub struct StackwalkAnalyzer {
    stackwalk: Option<PathBuf>,
}

impl StackwalkAnalyzer {
    pub fn new(stackwalk: Option<PathBuf>) -> Self {
        Self { stackwalk }
    }

    fn walk(&self, stackwalk: &Path, dump: &Path, symbols_path: Option<&Path>) -> Option<String> {
        let mut cmd = Command::new(stackwalk);
        cmd.arg(dump);
        if let Some(symbols) = symbols_path {
            cmd.arg(symbols);
        }
        match cmd.output() {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                warn!(
                    "{} failed on {}: {}",
                    stackwalk.display(),
                    dump.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                warn!("Failed to run {}: {}", stackwalk.display(), e);
                None
            }
        }
    }
}

impl CrashAnalyzer for StackwalkAnalyzer {
    fn analyze(&self, dump_dir: &Path, symbols_path: Option<&Path>, test_name: &str) -> Result<CrashReport> {
        let mut report = CrashReport::default();
        find_dumps(dump_dir, &mut report.dumps)?;
        report.dumps.sort();

        for dump in &report.dumps {
            error!(
                "PROCESS-CRASH | {} | application crashed [{}]",
                test_name,
                dump.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
            );
            match &self.stackwalk {
                Some(stackwalk) => {
                    if let Some(stack) = self.walk(stackwalk, dump, symbols_path) {
                        info!("{}", stack);
                        report.stacks.push(stack);
                    }
                }
                None => debug!("No stackwalker configured, skipping {}", dump.display()),
            }
        }
        Ok(report)
    }
}

fn find_dumps(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            find_dumps(&path, found)?;
        } else if path.extension().is_some_and(|ext| ext == "dmp") {
            found.push(path);
        }
    }
    Ok(())
}
