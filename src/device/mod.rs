//! Device-control primitives and the session wrapper around them.
//!
//! A remote device exposes only a handful of blocking operations: run a
//! shell command, push or pull files, manipulate directories, and read
//! system properties. The `Device` trait captures exactly those; the
//! `DeviceSession` adds the bounded property-read retry and the device-root
//! test path every other component derives its paths from.

pub mod adb;
pub mod retry;
pub mod scripted;

use crate::error::{Error, Result};
use log::{debug, info};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

pub use adb::{diagnose_adb_error, AdbDevice};
pub use retry::{retry_with_backoff, RetryConfig};
pub use scripted::{DeviceCall, ScriptedDevice, ShellScript};

/// Property holding the device's primary CPU ABI.
pub const PROP_CPU_ABI: &str = "ro.product.cpu.abi";

/// Property holding the comma-separated list of supported ABIs.
pub const PROP_CPU_ABILIST: &str = "ro.product.cpu.abilist";

/// Property holding the Android SDK level.
pub const PROP_SDK_VERSION: &str = "ro.build.version.sdk";

/// Result of a remote shell invocation.
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    /// Exit code of the remote command, when the transport could recover it
    pub exit_code: Option<i32>,
    /// Combined output of the remote command
    pub output: String,
}

impl ShellOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Raw, synchronous device-control primitives.
///
/// Every call blocks until the device answers. `shell` enforces its own
/// wall-clock cutoff and reports expiry as `Error::DeviceTimeout`.
pub trait Device {
    fn shell(&self, command: &str, timeout: Option<Duration>) -> Result<ShellOutput>;

    fn push(&self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<()>;

    fn pull(&self, remote: &str, local: &Path) -> Result<()>;

    fn mkdir(&self, path: &str, parents: bool) -> Result<()>;

    fn rm(&self, path: &str, recursive: bool, force: bool) -> Result<()>;

    fn chmod(&self, path: &str, recursive: bool) -> Result<()>;

    /// Reads a system property. An empty string is a legitimate answer.
    fn get_prop(&self, name: &str) -> Result<String>;

    /// Returns true if a process with the given name is running.
    fn process_exists(&self, name: &str) -> Result<bool>;

    /// Kills every process with the given name.
    fn pkill(&self, name: &str) -> Result<()>;

    /// Establishes a reverse socket forward from device to host.
    fn reverse(&self, remote: &str, local: &str) -> Result<()>;

    /// Serial number of the device, when known.
    fn serial(&self) -> Option<String> {
        None
    }
}

impl<D: Device + ?Sized> Device for Rc<D> {
    fn shell(&self, command: &str, timeout: Option<Duration>) -> Result<ShellOutput> {
        (**self).shell(command, timeout)
    }

    fn push(&self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<()> {
        (**self).push(local, remote, timeout)
    }

    fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        (**self).pull(remote, local)
    }

    fn mkdir(&self, path: &str, parents: bool) -> Result<()> {
        (**self).mkdir(path, parents)
    }

    fn rm(&self, path: &str, recursive: bool, force: bool) -> Result<()> {
        (**self).rm(path, recursive, force)
    }

    fn chmod(&self, path: &str, recursive: bool) -> Result<()> {
        (**self).chmod(path, recursive)
    }

    fn get_prop(&self, name: &str) -> Result<String> {
        (**self).get_prop(name)
    }

    fn process_exists(&self, name: &str) -> Result<bool> {
        (**self).process_exists(name)
    }

    fn pkill(&self, name: &str) -> Result<()> {
        (**self).pkill(name)
    }

    fn reverse(&self, remote: &str, local: &str) -> Result<()> {
        (**self).reverse(remote, local)
    }

    fn serial(&self) -> Option<String> {
        (**self).serial()
    }
}

/// One connected device plus the parameters every component shares.
pub struct DeviceSession {
    device: Box<dyn Device>,
    test_root: String,
    retry_config: RetryConfig,
}

impl DeviceSession {
    /// Creates a session rooted at `test_root` on the device.
    pub fn new(device: Box<dyn Device>, test_root: impl Into<String>) -> Self {
        Self {
            device,
            test_root: test_root.into(),
            retry_config: RetryConfig::default(),
        }
    }

    /// Replaces the property-read retry policy.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Device-root test path.
    pub fn test_root(&self) -> &str {
        &self.test_root
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn shell(&self, command: &str, timeout: Option<Duration>) -> Result<ShellOutput> {
        self.device.shell(command, timeout)
    }

    pub fn push(&self, local: &Path, remote: &str) -> Result<()> {
        debug!("push {} -> {}", local.display(), remote);
        self.device.push(local, remote, None)
    }

    /// Pushes the contents of `local_dir` into `remote_dir`.
    ///
    /// adb nests a pushed directory under its own name when the destination
    /// already exists, so the entries are pushed one by one into a
    /// destination that is guaranteed to exist.
    pub fn push_dir(&self, local_dir: &Path, remote_dir: &str, timeout: Option<Duration>) -> Result<()> {
        debug!("push contents of {} -> {}", local_dir.display(), remote_dir);
        self.device.mkdir(remote_dir, true)?;
        let mut entries = std::fs::read_dir(local_dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();
        for entry in entries {
            self.device.push(&entry, remote_dir, timeout)?;
        }
        Ok(())
    }

    pub fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        debug!("pull {} -> {}", remote, local.display());
        self.device.pull(remote, local)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.device.mkdir(path, true)
    }

    pub fn rm(&self, path: &str, recursive: bool, force: bool) -> Result<()> {
        self.device.rm(path, recursive, force)
    }

    pub fn chmod(&self, path: &str, recursive: bool) -> Result<()> {
        self.device.chmod(path, recursive)
    }

    pub fn process_exists(&self, name: &str) -> Result<bool> {
        self.device.process_exists(name)
    }

    pub fn pkill(&self, name: &str) -> Result<()> {
        self.device.pkill(name)
    }

    pub fn reverse(&self, remote: &str, local: &str) -> Result<()> {
        self.device.reverse(remote, local)
    }

    /// Reads a property, retrying while the device answers with nothing.
    ///
    /// Returns `Ok(None)` if the property is still empty once the retry
    /// budget is spent. Hard device errors are returned immediately.
    pub fn read_property(&self, name: &str) -> Result<Option<String>> {
        let operation_name = format!("read of property {}", name);
        let result = retry_with_backoff(
            &self.retry_config,
            || {
                let value = self.device.get_prop(name)?;
                let value = value.trim();
                if value.is_empty() {
                    Err(Error::PropertyUnavailable(name.to_string()))
                } else {
                    Ok(value.to_string())
                }
            },
            &operation_name,
        );

        match result {
            Ok(value) => {
                info!("{} {}", name, value);
                Ok(Some(value))
            }
            Err(Error::PropertyUnavailable(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads a property the caller cannot proceed without.
    pub fn require_property(&self, name: &str) -> Result<String> {
        self.read_property(name)?
            .ok_or_else(|| Error::PropertyUnavailable(name.to_string()))
    }
}

/// Joins remote (POSIX) path components.
pub fn remote_join(base: &str, child: &str) -> String {
    let child = child.trim_start_matches("./");
    if child.is_empty() || child == "." {
        return base.to_string();
    }
    if child.starts_with('/') {
        return child.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), child)
}

/// Quotes one argument for the device's `sh`, leaving plain words alone.
pub fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Renders an argument vector as a single remote command line.
pub fn escape_command_line<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| quote_arg(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
