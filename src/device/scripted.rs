//! In-memory device that follows a script.
//!
//! `ScriptedDevice` keeps a model of the remote filesystem, answers property
//! reads and shell commands from queued responses, and records every
//! primitive it receives. `--dry-run` uses it to show what a run would do
//! without touching hardware; the test suite uses it to drive the
//! orchestrator through failure paths a real device produces only rarely.

use crate::device::{Device, ShellOutput};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// A scripted answer to the next shell invocation.
#[derive(Debug, Clone)]
pub enum ShellScript {
    /// Command completes with the given exit code and output
    Exit(i32, String),
    /// Command completes but the transport loses its exit code
    NoExitCode(String),
    /// Command exceeds its cutoff
    Timeout,
    /// Transport fails with an unexpected error
    Fail(String),
    /// Device disappears
    Lost(String),
}

/// A primitive received by the device, in order of arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Shell(String),
    Push { local: String, remote: String },
    Pull { remote: String, local: String },
    Mkdir(String),
    Rm(String),
    Chmod(String),
    GetProp(String),
    ProcessExists(String),
    Pkill(String),
    Reverse { remote: String, local: String },
}

impl fmt::Display for DeviceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCall::Shell(cmd) => write!(f, "shell {}", cmd),
            DeviceCall::Push { local, remote } => write!(f, "push {} {}", local, remote),
            DeviceCall::Pull { remote, local } => write!(f, "pull {} {}", remote, local),
            DeviceCall::Mkdir(path) => write!(f, "mkdir -p {}", path),
            DeviceCall::Rm(path) => write!(f, "rm -rf {}", path),
            DeviceCall::Chmod(path) => write!(f, "chmod 777 {}", path),
            DeviceCall::GetProp(name) => write!(f, "getprop {}", name),
            DeviceCall::ProcessExists(name) => write!(f, "pidof {}", name),
            DeviceCall::Pkill(name) => write!(f, "pkill {}", name),
            DeviceCall::Reverse { remote, local } => write!(f, "reverse {} {}", remote, local),
        }
    }
}

#[derive(Default)]
struct ScriptState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    properties: HashMap<String, VecDeque<String>>,
    property_reads: HashMap<String, usize>,
    shell_script: VecDeque<ShellScript>,
    running: BTreeSet<String>,
    reversed: Vec<(String, String)>,
    failing_kills: bool,
    failing_pulls: bool,
    failing_process_checks: bool,
    calls: Vec<DeviceCall>,
}

impl ScriptState {
    fn exists(&self, path: &str) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path)
    }

    fn add_dir_with_parents(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    fn add_file(&mut self, path: &str, contents: Vec<u8>) {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.add_dir_with_parents(parent);
        }
        self.files.insert(path.to_string(), contents);
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.dirs.iter().any(|d| d.starts_with(&prefix))
            || self.files.keys().any(|f| f.starts_with(&prefix))
    }

    fn remove_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        self.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        self.files.retain(|f, _| f != path && !f.starts_with(&prefix));
    }
}

/// Device backed by an in-memory filesystem and a response script.
#[derive(Default)]
pub struct ScriptedDevice {
    serial: Option<String>,
    state: RefCell<ScriptState>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            ..Self::default()
        }
    }

    /// Queues answers for a property. The last answer repeats forever.
    pub fn script_property(&self, name: &str, answers: &[&str]) {
        self.state.borrow_mut().properties.insert(
            name.to_string(),
            answers.iter().map(|a| a.to_string()).collect(),
        );
    }

    /// Queues an answer for the next shell invocation.
    pub fn script_shell(&self, response: ShellScript) {
        self.state.borrow_mut().shell_script.push_back(response);
    }

    /// Makes every subsequent `pkill` fail.
    pub fn fail_kills(&self) {
        self.state.borrow_mut().failing_kills = true;
    }

    /// Makes every subsequent `pull` fail.
    pub fn fail_pulls(&self) {
        self.state.borrow_mut().failing_pulls = true;
    }

    /// Makes every subsequent process lookup time out.
    pub fn fail_process_checks(&self) {
        self.state.borrow_mut().failing_process_checks = true;
    }

    /// Marks a process as running until it is killed.
    pub fn start_process(&self, name: &str) {
        self.state.borrow_mut().running.insert(name.to_string());
    }

    /// Places a file on the device, creating its parent directories.
    pub fn add_file(&self, path: &str, contents: &[u8]) {
        self.state.borrow_mut().add_file(path, contents.to_vec());
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        self.state.borrow().dirs.contains(path)
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.state.borrow().files.contains_key(path)
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state.borrow().files.get(path).cloned()
    }

    /// Every file below `dir`, at any depth.
    pub fn files_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.state
            .borrow()
            .files
            .keys()
            .filter(|f| f.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn property_reads(&self, name: &str) -> usize {
        self.state
            .borrow()
            .property_reads
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn reversed(&self) -> Vec<(String, String)> {
        self.state.borrow().reversed.clone()
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.borrow().calls.clone()
    }

    pub fn shell_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Shell(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn kill_count(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, DeviceCall::Pkill(n) if n == name))
            .count()
    }

    fn record(&self, call: DeviceCall) {
        self.state.borrow_mut().calls.push(call);
    }

    fn push_dir(state: &mut ScriptState, local: &Path, remote: &str) -> Result<()> {
        state.add_dir_with_parents(remote);
        for entry in fs::read_dir(local)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let target = format!("{}/{}", remote, name);
            if entry.file_type()?.is_dir() {
                Self::push_dir(state, &entry.path(), &target)?;
            } else {
                state.add_file(&target, fs::read(entry.path())?);
            }
        }
        Ok(())
    }
}

impl Device for ScriptedDevice {
    fn shell(&self, command: &str, timeout: Option<Duration>) -> Result<ShellOutput> {
        self.record(DeviceCall::Shell(command.to_string()));
        let response = self
            .state
            .borrow_mut()
            .shell_script
            .pop_front()
            .unwrap_or(ShellScript::Exit(0, String::new()));

        match response {
            ShellScript::Exit(code, output) => Ok(ShellOutput {
                exit_code: Some(code),
                output,
            }),
            ShellScript::NoExitCode(output) => Ok(ShellOutput {
                exit_code: None,
                output,
            }),
            ShellScript::Timeout => Err(Error::DeviceTimeout {
                command: command.to_string(),
                timeout: timeout.unwrap_or_default(),
            }),
            ShellScript::Fail(message) => Err(Error::Device(message)),
            ShellScript::Lost(message) => Err(Error::DeviceLost(message)),
        }
    }

    fn push(&self, local: &Path, remote: &str, _timeout: Option<Duration>) -> Result<()> {
        self.record(DeviceCall::Push {
            local: local.display().to_string(),
            remote: remote.to_string(),
        });
        let mut state = self.state.borrow_mut();
        // Like adb, an existing destination directory receives the source
        // under its own name.
        let target = match local.file_name() {
            Some(name) if state.dirs.contains(remote) => {
                format!("{}/{}", remote.trim_end_matches('/'), name.to_string_lossy())
            }
            _ => remote.to_string(),
        };
        if local.is_dir() {
            Self::push_dir(&mut state, local, &target)
        } else {
            let contents = fs::read(local)?;
            state.add_file(&target, contents);
            Ok(())
        }
    }

    fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        self.record(DeviceCall::Pull {
            remote: remote.to_string(),
            local: local.display().to_string(),
        });
        let state = self.state.borrow();
        if state.failing_pulls {
            return Err(Error::Device(format!("failed to pull {}", remote)));
        }
        if let Some(contents) = state.files.get(remote) {
            let name = remote.rsplit('/').next().unwrap_or(remote);
            let target = if local.is_dir() {
                local.join(name)
            } else {
                local.to_path_buf()
            };
            fs::write(target, contents)?;
            return Ok(());
        }
        if !state.dirs.contains(remote) {
            return Err(Error::Device(format!("remote object '{}' does not exist", remote)));
        }

        let prefix = format!("{}/", remote);
        fs::create_dir_all(local)?;
        for dir in state.dirs.iter().filter(|d| d.starts_with(&prefix)) {
            fs::create_dir_all(local.join(&dir[prefix.len()..]))?;
        }
        for (file, contents) in state.files.iter().filter(|(f, _)| f.starts_with(&prefix)) {
            let target = local.join(&file[prefix.len()..]);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, contents)?;
        }
        Ok(())
    }

    fn mkdir(&self, path: &str, parents: bool) -> Result<()> {
        self.record(DeviceCall::Mkdir(path.to_string()));
        let mut state = self.state.borrow_mut();
        if !parents {
            if let Some((parent, _)) = path.rsplit_once('/') {
                if !parent.is_empty() && !state.dirs.contains(parent) {
                    return Err(Error::Device(format!(
                        "mkdir: '{}': No such file or directory",
                        path
                    )));
                }
            }
        }
        state.add_dir_with_parents(path);
        Ok(())
    }

    fn rm(&self, path: &str, recursive: bool, force: bool) -> Result<()> {
        self.record(DeviceCall::Rm(path.to_string()));
        let mut state = self.state.borrow_mut();
        if !state.exists(path) {
            if force {
                return Ok(());
            }
            return Err(Error::Device(format!("rm: {}: No such file or directory", path)));
        }
        if !recursive && state.has_children(path) {
            return Err(Error::Device(format!("rm: {}: Is a directory", path)));
        }
        state.remove_tree(path);
        Ok(())
    }

    fn chmod(&self, path: &str, _recursive: bool) -> Result<()> {
        self.record(DeviceCall::Chmod(path.to_string()));
        if !self.state.borrow().exists(path) {
            return Err(Error::Device(format!("chmod: {}: No such file or directory", path)));
        }
        Ok(())
    }

    fn get_prop(&self, name: &str) -> Result<String> {
        self.record(DeviceCall::GetProp(name.to_string()));
        let mut state = self.state.borrow_mut();
        *state.property_reads.entry(name.to_string()).or_insert(0) += 1;
        let answers = match state.properties.get_mut(name) {
            Some(answers) => answers,
            None => return Ok(String::new()),
        };
        let value = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().cloned()
        };
        Ok(value.unwrap_or_default())
    }

    fn process_exists(&self, name: &str) -> Result<bool> {
        self.record(DeviceCall::ProcessExists(name.to_string()));
        let state = self.state.borrow();
        if state.failing_process_checks {
            return Err(Error::DeviceTimeout {
                command: format!("pidof {}", name),
                timeout: Duration::from_secs(0),
            });
        }
        Ok(state.running.contains(name))
    }

    fn pkill(&self, name: &str) -> Result<()> {
        self.record(DeviceCall::Pkill(name.to_string()));
        let mut state = self.state.borrow_mut();
        if state.failing_kills {
            return Err(Error::Device(format!("pkill {}: device not responding", name)));
        }
        state.running.remove(name);
        Ok(())
    }

    fn reverse(&self, remote: &str, local: &str) -> Result<()> {
        self.record(DeviceCall::Reverse {
            remote: remote.to_string(),
            local: local.to_string(),
        });
        self.state
            .borrow_mut()
            .reversed
            .push((remote.to_string(), local.to_string()));
        Ok(())
    }

    fn serial(&self) -> Option<String> {
        self.serial.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mkdir_creates_parents() {
        let device = ScriptedDevice::new();
        device.mkdir("/data/local/tmp/xpc/bin", true).unwrap();
        assert!(device.dir_exists("/data/local"));
        assert!(device.dir_exists("/data/local/tmp/xpc/bin"));
    }

    #[test]
    fn test_rm_missing_path_requires_force() {
        let device = ScriptedDevice::new();
        assert!(device.rm("/nope", true, true).is_ok());
        assert!(device.rm("/nope", true, false).is_err());
    }

    #[test]
    fn test_push_and_pull_directory() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/a.dmp"), b"dump").unwrap();

        let device = ScriptedDevice::new();
        device.push(src.path(), "/data/m", None).unwrap();
        assert_eq!(device.files_under("/data/m"), vec!["/data/m/sub/a.dmp".to_string()]);

        let dst = TempDir::new().unwrap();
        device.pull("/data/m", dst.path()).unwrap();
        assert_eq!(fs::read(dst.path().join("sub/a.dmp")).unwrap(), b"dump");
    }

    #[test]
    fn test_push_into_existing_directory_nests() {
        let src = TempDir::new().unwrap();
        let b2g = src.path().join("b2g");
        fs::create_dir(&b2g).unwrap();
        fs::write(b2g.join("libxul.so"), b"elf").unwrap();
        fs::write(src.path().join("head.js"), b"// head").unwrap();

        let device = ScriptedDevice::new();
        device.mkdir("/data/xpc/bin", true).unwrap();
        device.push(&b2g, "/data/xpc/bin", None).unwrap();
        device.push(&src.path().join("head.js"), "/data/xpc/bin", None).unwrap();

        assert!(device.file_exists("/data/xpc/bin/b2g/libxul.so"));
        assert!(!device.file_exists("/data/xpc/bin/libxul.so"));
        assert!(device.file_exists("/data/xpc/bin/head.js"));
    }

    #[test]
    fn test_shell_follows_script() {
        let device = ScriptedDevice::new();
        device.script_shell(ShellScript::Exit(3, "boom".to_string()));
        device.script_shell(ShellScript::Timeout);

        let first = device.shell("a", None).unwrap();
        assert_eq!(first.exit_code, Some(3));
        assert!(device.shell("b", Some(Duration::from_secs(5))).unwrap_err().is_timeout());
        assert!(device.shell("c", None).unwrap().is_success());
        assert_eq!(device.shell_commands(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_property_answers_repeat_last() {
        let device = ScriptedDevice::new();
        device.script_property("ro.x", &["", "v"]);
        assert_eq!(device.get_prop("ro.x").unwrap(), "");
        assert_eq!(device.get_prop("ro.x").unwrap(), "v");
        assert_eq!(device.get_prop("ro.x").unwrap(), "v");
        assert_eq!(device.property_reads("ro.x"), 3);
    }
}
