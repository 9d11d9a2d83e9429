//! Per-test process launch, supervision and result resolution.
//!
//! The device offers no waitable process handle: a launched test is only
//! observable by asking whether a process with the harness's name exists.
//! Each launch is therefore tracked by an explicit `ProcessHandle` state
//! machine with a locally kept timed-out flag, and every launch is followed
//! by a kill keyed on the harness name. That cleanup is only correct because
//! a single test runs on the device at any time.

use crate::device::{escape_command_line, remote_join, DeviceSession};
use crate::error::{Error, Result};
use crate::manifest::TestDescriptor;
use crate::remote::crash::{CrashAnalyzer, CrashReport};
use crate::remote::deploy::{push_contents, render_prefs};
use crate::remote::env::Environment;
use crate::remote::paths::PathTranslator;
use crate::remote::workspace::{RemoteWorkspace, WorkspaceProvisioner};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Exit code reported when the real one could not be recovered.
pub const UNKNOWN_FAILURE: i32 = -1;

/// Extra time given to the device transport beyond the test's own timeout.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle of one launched test process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Built,
    Launched,
    Running,
    TimedOut,
    Finished,
    Reported,
}

/// Flag raised once a test has exceeded its timeout.
#[derive(Debug, Clone, Default)]
pub struct TimeoutSignal(Arc<AtomicBool>);

impl TimeoutSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Logical handle for a test process running on the device.
#[derive(Debug)]
pub struct ProcessHandle {
    test_name: String,
    state: ProcessState,
    exit_code: Option<i32>,
    timed_out: TimeoutSignal,
    output: String,
}

impl ProcessHandle {
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            state: ProcessState::Built,
            exit_code: None,
            timed_out: TimeoutSignal::new(),
            output: String::new(),
        }
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.is_raised()
    }

    /// A handle to the timed-out flag for whoever watches the clock.
    pub fn timeout_signal(&self) -> TimeoutSignal {
        self.timed_out.clone()
    }

    /// Captured exit code, or `UNKNOWN_FAILURE` when none was captured.
    pub fn return_code(&self) -> i32 {
        self.exit_code.unwrap_or(UNKNOWN_FAILURE)
    }

    fn mark_timed_out(&mut self) {
        self.timed_out.raise();
        self.state = ProcessState::TimedOut;
    }
}

/// Raises a handle's timeout signal if not cancelled in time.
///
/// The watchdog never touches the device; it only flips the flag so the
/// runner can tell a real timeout from an unrelated transport error.
struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(signal: TimeoutSignal, after: Duration, test_name: &str) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let test_name = test_name.to_string();
        let thread = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(after) {
                warn!("{} exceeded its timeout of {:?}", test_name, after);
                signal.raise();
            }
        });
        Self {
            cancel: Some(cancel),
            thread: Some(thread),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread immediately
        self.cancel.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// How a test ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed { exit_code: i32 },
    TimedOut,
    Crashed,
}

impl TestOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "passed"),
            TestOutcome::Failed { exit_code } => write!(f, "failed (exit code {})", exit_code),
            TestOutcome::TimedOut => write!(f, "timed out"),
            TestOutcome::Crashed => write!(f, "crashed"),
        }
    }
}

/// Result of one test.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: String,
    pub outcome: TestOutcome,
    pub duration: Duration,
    pub output: String,
}

/// Build and device facts exposed to tests as `mozinfo.json`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MozInfo {
    pub os: String,
    pub android_version: Option<String>,
    pub is_emulator: bool,
    pub abi: String,
}

impl MozInfo {
    pub fn new(android_version: Option<String>, serial: Option<&str>, abi: &str) -> Self {
        Self {
            os: "android".to_string(),
            android_version,
            is_emulator: serial.is_some_and(|s| s.starts_with("emulator-")),
            abi: abi.to_string(),
        }
    }
}

/// Per-session settings for launching tests.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Process name of the harness executable on the device
    pub harness: String,
    pub timeout: Duration,
    pub debugger: Option<String>,
    pub debugger_args: Vec<String>,
    /// Remote package path when tests run against an installed package
    pub remote_package: Option<String>,
    /// Remote preferences file, if one was deployed
    pub prefs_file: Option<String>,
    /// Shared preferences, repeated in a test's own prefs file
    pub prefs: Vec<(String, String)>,
    /// Local plugins directory copied for every test
    pub plugins_dir: Option<PathBuf>,
    pub symbols_path: Option<PathBuf>,
    pub mozinfo: MozInfo,
}

/// Remote files a single test runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestFiles {
    pub prefs_file: Option<String>,
    pub plugins_dir: Option<String>,
}

/// Launches tests one at a time and reports their results.
pub struct TestProcessRunner<'a> {
    session: &'a DeviceSession,
    workspace: &'a RemoteWorkspace,
    translator: &'a PathTranslator,
    env: &'a Environment,
    analyzer: &'a dyn CrashAnalyzer,
    options: RunnerOptions,
}

impl<'a> TestProcessRunner<'a> {
    pub fn new(
        session: &'a DeviceSession,
        workspace: &'a RemoteWorkspace,
        translator: &'a PathTranslator,
        env: &'a Environment,
        analyzer: &'a dyn CrashAnalyzer,
        options: RunnerOptions,
    ) -> Self {
        Self {
            session,
            workspace,
            translator,
            env,
            analyzer,
            options,
        }
    }

    fn provisioner(&self) -> WorkspaceProvisioner<'_> {
        WorkspaceProvisioner::new(self.session, self.workspace)
    }

    /// Pushes the files specific to one test into the freshly reset temp
    /// directory.
    ///
    /// A test with its own prefs gets a `user.js` holding the shared prefs
    /// followed by its own; other tests use the shared file.
    pub fn prepare_test_files(&self, test: &TestDescriptor) -> Result<TestFiles> {
        let prefs_file = if test.prefs.is_empty() {
            self.options.prefs_file.clone()
        } else {
            let remote = remote_join(&self.workspace.tmp, "user.js");
            let prefs: Vec<(String, String)> = self
                .options
                .prefs
                .iter()
                .chain(test.prefs.iter())
                .cloned()
                .collect();
            push_contents(self.session, render_prefs(&prefs)?.as_bytes(), &remote)?;
            Some(remote)
        };

        let plugins_dir = match self.options.plugins_dir {
            Some(ref local) if local.is_dir() => {
                let remote = remote_join(&self.workspace.tmp, "plugins");
                self.session.push_dir(local, &remote, None)?;
                self.session.chmod(&remote, true)?;
                debug!("plugins dir is {}", remote);
                Some(remote)
            }
            _ => None,
        };

        Ok(TestFiles {
            prefs_file,
            plugins_dir,
        })
    }

    /// Builds the device command line for a test.
    ///
    /// Shape: `[debugger [args..]] xpcw <remote cwd> <dir flag> <dir>
    /// <harness setup> <test flags..> [-p <plugins>]`.
    pub fn build_command(&self, test: &TestDescriptor, files: &TestFiles) -> Result<Vec<String>> {
        let ws = self.workspace;
        let remote_here = self.translator.resolve_dir(&test.here);

        let mut cmd = Vec::new();
        if let Some(ref debugger) = self.options.debugger {
            cmd.push(debugger.clone());
            cmd.extend(self.options.debugger_args.iter().cloned());
        }
        cmd.push(ws.wrapper());
        cmd.push(remote_here.clone());

        match self.options.remote_package {
            Some(ref package) => {
                cmd.push("--greomni".to_string());
                cmd.push(package.clone());
            }
            None => {
                cmd.push("-g".to_string());
                cmd.push(ws.bin.clone());
            }
        }

        let head_js = ws.head_js();
        cmd.push("-e".to_string());
        cmd.push(format!("const _HEAD_JS_PATH = {};", serde_json::to_string(&head_js)?));
        cmd.push("-e".to_string());
        cmd.push(format!(
            "const _TESTING_MODULES_DIR = {};",
            serde_json::to_string(&ws.modules)?
        ));
        if let Some(ref prefs) = files.prefs_file {
            cmd.push("-e".to_string());
            cmd.push(format!("const _PREFS_FILE = {};", serde_json::to_string(prefs)?));
        }
        cmd.push("-f".to_string());
        cmd.push(head_js);

        let head_files: Vec<String> = test
            .head_files
            .iter()
            .map(|f| remote_join(&remote_here, f))
            .collect();
        cmd.push("-e".to_string());
        cmd.push(format!("const _HEAD_FILES = {};", serde_json::to_string(&head_files)?));

        cmd.push("-e".to_string());
        cmd.push(format!(
            "const _TEST_FILE = {};",
            serde_json::to_string(&[self.remote_test_file(test, &remote_here)])?
        ));

        cmd.extend(test.flags.iter().cloned());
        if let Some(ref plugins) = files.plugins_dir {
            cmd.push("-p".to_string());
            cmd.push(plugins.clone());
        }
        Ok(cmd)
    }

    /// Remote name of the test script, relative to the cwd when possible.
    fn remote_test_file(&self, test: &TestDescriptor, remote_here: &str) -> String {
        let remote = self.translator.resolve(&test.path);
        match remote.rsplit_once('/') {
            Some((dir, name)) if dir == remote_here => name.to_string(),
            _ => remote,
        }
    }

    /// Runs `cmd` on the device and records the outcome in `handle`.
    ///
    /// A `DeviceTimeout` marks the handle timed out and is returned. Any
    /// other error is swallowed when the handle had already timed out, since
    /// the transport failing after a timeout is expected, and returned
    /// otherwise. The harness process is killed after every invocation.
    pub fn launch(&self, handle: &mut ProcessHandle, cmd: &[String], timeout: Duration) -> Result<()> {
        handle.state = ProcessState::Launched;
        let command_line = escape_command_line(cmd);

        let result = match self.session.shell(&command_line, Some(timeout + TIMEOUT_GRACE)) {
            Ok(output) => {
                handle.exit_code = output.exit_code;
                handle.output = output.output;
                handle.state = ProcessState::Running;
                Ok(())
            }
            Err(e @ Error::DeviceTimeout { .. }) => {
                handle.mark_timed_out();
                Err(e)
            }
            Err(e) if handle.timed_out() => {
                debug!("Ignoring error after timeout of {}: {}", handle.test_name, e);
                handle.exit_code = None;
                handle.state = ProcessState::TimedOut;
                Ok(())
            }
            Err(e) => Err(e),
        };

        // Hung or killed tests may leave harness processes behind; IPC tests
        // may also have spawned more of them.
        if let Err(e) = self.kill(handle) {
            warn!("Failed to kill {} after {}: {}", self.options.harness, handle.test_name, e);
        }
        result
    }

    /// Returns `None` while the harness process is still observable, else
    /// the final exit code.
    pub fn poll(&self, handle: &mut ProcessHandle) -> Result<Option<i32>> {
        if self.session.process_exists(&self.options.harness)? {
            return Ok(None);
        }
        if handle.state != ProcessState::TimedOut {
            handle.state = ProcessState::Finished;
        }
        Ok(Some(handle.return_code()))
    }

    pub fn kill(&self, _handle: &ProcessHandle) -> Result<()> {
        self.session.pkill(&self.options.harness)
    }

    /// Pulls and analyzes crash dumps, then empties the remote dump directory
    /// whatever the analysis did.
    pub fn check_for_crashes(&self, test_name: &str) -> Result<CrashReport> {
        let analysis = (|| -> Result<CrashReport> {
            let scratch = TempDir::new()?;
            self.session.pull(&self.workspace.minidumps, scratch.path())?;
            self.analyzer
                .analyze(scratch.path(), self.options.symbols_path.as_deref(), test_name)
        })();
        let reset = self.provisioner().reset_minidumps();

        match (analysis, reset) {
            (Ok(report), Ok(())) => Ok(report),
            (Err(e), reset) => {
                if let Err(reset_err) = reset {
                    warn!("Failed to reset {}: {}", self.workspace.minidumps, reset_err);
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        }
    }

    fn push_mozinfo(&self) -> Result<()> {
        let contents = serde_json::to_vec_pretty(&self.options.mozinfo)?;
        push_contents(
            self.session,
            &contents,
            &remote_join(&self.workspace.profile, "mozinfo.json"),
        )
    }

    fn log_command(&self, name: &str, cmd: &[String], cwd: &str) {
        info!("{} | full command: {:?}", name, cmd);
        info!("{} | current directory: {:?}", name, cwd);
        let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        info!("{} | environment: {:?}", name, env);
    }

    /// Runs one test end to end: reset scratch state, launch, resolve the
    /// exit status and check for crashes.
    pub fn run_test(&self, test: &TestDescriptor) -> Result<TestResult> {
        info!("TEST-START | {}", test.name);
        let start = Instant::now();

        self.provisioner().reset_test_state()?;
        self.push_mozinfo()?;
        let files = self.prepare_test_files(test)?;

        let cmd = self.build_command(test, &files)?;
        self.log_command(&test.name, &cmd, &self.translator.resolve_dir(&test.here));

        let mut handle = ProcessHandle::new(test.name.as_str());
        let launched = {
            let _watchdog = Watchdog::arm(handle.timeout_signal(), self.options.timeout, &test.name);
            self.launch(&mut handle, &cmd, self.options.timeout)
        };

        match launched {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                error!("TEST-UNEXPECTED-TIMEOUT | {} | {}", test.name, e);
            }
            Err(e) => {
                if let Err(reset_err) = self.provisioner().reset_minidumps() {
                    warn!("Failed to reset minidumps: {}", reset_err);
                }
                return Err(e);
            }
        }

        // An unresponsive device must not hide the crash check or turn a
        // timeout into an error.
        let status = match self.poll(&mut handle) {
            Ok(Some(code)) => code,
            Ok(None) => {
                warn!("{} still running after launch returned, killing it", self.options.harness);
                if let Err(e) = self.kill(&handle) {
                    warn!("Failed to kill {}: {}", self.options.harness, e);
                }
                handle.return_code()
            }
            Err(e) if e.is_device_lost() => return Err(e),
            Err(e) => {
                warn!("Failed to poll {} after {}: {}", self.options.harness, test.name, e);
                handle.return_code()
            }
        };

        let crashed = match self.check_for_crashes(&test.name) {
            Ok(report) => report.crashed(),
            Err(e) => {
                warn!("Crash check for {} failed: {}", test.name, e);
                false
            }
        };

        let outcome = if handle.timed_out() {
            TestOutcome::TimedOut
        } else if crashed {
            TestOutcome::Crashed
        } else if status == 0 {
            TestOutcome::Passed
        } else {
            TestOutcome::Failed { exit_code: status }
        };
        handle.state = ProcessState::Reported;

        let duration = start.elapsed();
        if outcome.is_pass() {
            info!("TEST-PASS | {} | took {}ms", test.name, duration.as_millis());
        } else {
            for line in handle.output().lines() {
                info!("{} | {}", test.name, line);
            }
            error!("TEST-UNEXPECTED-FAIL | {} | {}", test.name, outcome);
        }

        Ok(TestResult {
            name: test.name.clone(),
            outcome,
            duration,
            output: handle.output,
        })
    }
}
