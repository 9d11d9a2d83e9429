//! adb-backed implementation of the device primitives.
//!
//! Every primitive is a blocking invocation of the `adb` executable against
//! one serial. Output is spooled to temporary files so a chatty test cannot
//! fill a pipe and stall the child, and the wall-clock cutoff is enforced by
//! polling the child and killing it once the deadline passes.

use crate::device::{quote_arg, Device, ShellOutput};
use crate::error::{Error, Result};
use log::{debug, warn};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default cutoff for device operations that do not specify one.
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(300);

/// Marker appended to shell commands to recover the remote exit status.
const RETURN_CODE_MARKER: &str = "adb_returncode=";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Output of a completed adb invocation.
struct AdbOutput {
    stdout: String,
}

/// Device reached through the `adb` command-line client.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb_path: String,
    serial: Option<String>,
    default_timeout: Duration,
}

impl AdbDevice {
    /// Creates a device handle. `serial` selects among several attached devices.
    pub fn new(adb_path: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            serial,
            default_timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Runs `adb [-s serial] <args>` with a wall-clock cutoff.
    fn run_adb(&self, args: &[&str], timeout: Option<Duration>) -> Result<AdbOutput> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let mut cmd = Command::new(&self.adb_path);
        if let Some(ref serial) = self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);

        let description = format!("adb {}", args.join(" "));
        debug!("Running: {}", description);

        let mut stdout_file = tempfile::tempfile()?;
        let mut stderr_file = tempfile::tempfile()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file.try_clone()?))
            .stderr(Stdio::from(stderr_file.try_clone()?));

        let mut child = cmd.spawn().map_err(|e| {
            Error::Device(diagnose_adb_error(&e.to_string(), &self.adb_path, self.serial.as_deref()))
        })?;

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!("{} exceeded {:?}, killing it", description, timeout);
                if let Err(e) = child.kill() {
                    debug!("Failed to kill adb child: {}", e);
                }
                let _ = child.wait();
                return Err(Error::DeviceTimeout {
                    command: description,
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = read_spool(&mut stdout_file)?;
        let stderr = read_spool(&mut stderr_file)?;

        if !status.success() {
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            if is_device_lost(&message) {
                return Err(Error::DeviceLost(message));
            }
            return Err(Error::Device(format!("{} failed: {}", description, message)));
        }

        Ok(AdbOutput { stdout })
    }

    /// Runs a shell command whose failure is an error.
    fn checked_shell(&self, command: &str) -> Result<String> {
        let result = self.shell(command, None)?;
        match result.exit_code {
            Some(0) | None => Ok(result.output),
            Some(code) => Err(Error::Device(format!(
                "'{}' exited with {}: {}",
                command,
                code,
                result.output.trim()
            ))),
        }
    }
}

impl Device for AdbDevice {
    fn shell(&self, command: &str, timeout: Option<Duration>) -> Result<ShellOutput> {
        let wrapped = format!("{}; echo {}$?", command, RETURN_CODE_MARKER);
        let output = self.run_adb(&["shell", wrapped.as_str()], timeout)?;
        Ok(split_return_code(&output.stdout))
    }

    fn push(&self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<()> {
        let local = local.to_string_lossy();
        self.run_adb(&["push", &*local, remote], timeout)?;
        Ok(())
    }

    fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        let local = local.to_string_lossy();
        self.run_adb(&["pull", remote, &*local], None)?;
        Ok(())
    }

    fn mkdir(&self, path: &str, parents: bool) -> Result<()> {
        let flag = if parents { "-p " } else { "" };
        self.checked_shell(&format!("mkdir {}{}", flag, quote_arg(path)))?;
        Ok(())
    }

    fn rm(&self, path: &str, recursive: bool, force: bool) -> Result<()> {
        let mut command = String::from("rm");
        if recursive {
            command.push_str(" -r");
        }
        if force {
            command.push_str(" -f");
        }
        command.push(' ');
        command.push_str(&quote_arg(path));
        self.checked_shell(&command)?;
        Ok(())
    }

    fn chmod(&self, path: &str, recursive: bool) -> Result<()> {
        let flag = if recursive { "-R " } else { "" };
        self.checked_shell(&format!("chmod {}777 {}", flag, quote_arg(path)))?;
        Ok(())
    }

    fn get_prop(&self, name: &str) -> Result<String> {
        let output = self.checked_shell(&format!("getprop {}", quote_arg(name)))?;
        Ok(output.trim().to_string())
    }

    fn process_exists(&self, name: &str) -> Result<bool> {
        let result = self.shell(&format!("pidof {}", quote_arg(name)), None)?;
        Ok(result.is_success() && !result.output.trim().is_empty())
    }

    fn pkill(&self, name: &str) -> Result<()> {
        // pkill exits 1 when nothing matched, which is fine here
        let result = self.shell(&format!("pkill {}", quote_arg(name)), None)?;
        match result.exit_code {
            Some(0) | Some(1) | None => Ok(()),
            Some(code) => Err(Error::Device(format!(
                "pkill {} exited with {}: {}",
                name,
                code,
                result.output.trim()
            ))),
        }
    }

    fn reverse(&self, remote: &str, local: &str) -> Result<()> {
        self.run_adb(&["reverse", remote, local], None)?;
        Ok(())
    }

    fn serial(&self) -> Option<String> {
        self.serial.clone()
    }
}

fn read_spool(file: &mut File) -> Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Separates the trailing return-code marker from command output.
fn split_return_code(stdout: &str) -> ShellOutput {
    let trimmed = stdout.trim_end();
    if let Some(pos) = trimmed.rfind(RETURN_CODE_MARKER) {
        let code = trimmed[pos + RETURN_CODE_MARKER.len()..].trim().parse::<i32>().ok();
        if code.is_some() {
            return ShellOutput {
                exit_code: code,
                output: trimmed[..pos].to_string(),
            };
        }
    }
    ShellOutput {
        exit_code: None,
        output: stdout.to_string(),
    }
}

fn is_device_lost(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("device not found")
        || message.contains("device offline")
        || message.contains("no devices/emulators found")
        || (message.contains("device") && message.contains("not found"))
}

/// Provides troubleshooting hints for adb failures.
pub fn diagnose_adb_error(error: &str, adb_path: &str, serial: Option<&str>) -> String {
    let error_lower = error.to_lowercase();
    let mut suggestions = Vec::new();

    if error_lower.contains("no such file")
        || (error_lower.contains("not found") && !error_lower.contains("device"))
    {
        suggestions.push(format!("• Verify adb is installed: {} version", adb_path));
        suggestions.push("• Point --adb at the adb binary from the Android SDK".to_string());
    }

    if error_lower.contains("unauthorized") {
        suggestions.push("• Accept the USB debugging prompt on the device".to_string());
        suggestions.push("• Restart the adb server: adb kill-server && adb start-server".to_string());
    }

    if error_lower.contains("offline")
        || (error_lower.contains("device") && error_lower.contains("not found"))
    {
        match serial {
            Some(serial) => suggestions.push(format!(
                "• Check that '{}' is listed by: {} devices",
                serial, adb_path
            )),
            None => suggestions.push(format!(
                "• Check that a device is listed by: {} devices",
                adb_path
            )),
        }
        suggestions.push("• Reconnect the device or restart the emulator".to_string());
    }

    if suggestions.is_empty() {
        suggestions.push(format!("• Run the command manually: {} devices -l", adb_path));
        suggestions.push("• Check the device log: adb logcat".to_string());
    }

    format!(
        "adb failed: {}\n\nTroubleshooting suggestions:\n{}",
        error,
        suggestions.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_return_code() {
        let out = split_return_code("hello\nworld\nadb_returncode=3\n");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.output, "hello\nworld\n");

        let out = split_return_code("adb_returncode=0");
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.output, "");
    }

    #[test]
    fn test_split_return_code_missing_marker() {
        let out = split_return_code("truncated output");
        assert_eq!(out.exit_code, None);
        assert_eq!(out.output, "truncated output");
    }

    #[test]
    fn test_is_device_lost() {
        assert!(is_device_lost("error: device 'emulator-5554' not found"));
        assert!(is_device_lost("error: device offline"));
        assert!(is_device_lost("adb: no devices/emulators found"));
        assert!(!is_device_lost("remote object '/x' does not exist"));
    }

    #[test]
    fn test_diagnose_offline_device() {
        let diagnosis = diagnose_adb_error("error: device offline", "adb", Some("emulator-5554"));
        assert!(diagnosis.contains("'emulator-5554' is listed"));
        assert!(diagnosis.contains("Reconnect the device"));
    }

    #[test]
    fn test_diagnose_missing_adb() {
        let diagnosis = diagnose_adb_error("No such file or directory (os error 2)", "/opt/adb", None);
        assert!(diagnosis.contains("/opt/adb version"));
    }

    #[test]
    fn test_diagnose_generic_error() {
        let diagnosis = diagnose_adb_error("protocol fault", "adb", None);
        assert!(diagnosis.contains("adb devices -l"));
    }
}
