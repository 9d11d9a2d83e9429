//! CLI command that runs a test list on a remote device.

use anyhow::{anyhow, Result};
use clap::Args;
use log::info;
use std::path::PathBuf;

use super::{explain, print_dry_run, DeviceArgs};
use xpcremote::config::Config;
use xpcremote::manifest::load_tests;
use xpcremote::remote::{RemoteHarness, TestOutcome};

#[derive(Args, Debug)]
#[command(about = "Run xpcshell tests on a remote Android device")]
pub struct RunCommand {
    /// YAML test list
    pub manifest: PathBuf,

    /// Only run tests whose path contains this string (repeatable)
    #[arg(long = "test-path")]
    pub test_paths: Vec<String>,

    #[command(flatten)]
    pub device: DeviceArgs,

    /// Build output directory
    #[arg(long)]
    pub objdir: Option<PathBuf>,

    /// Local directory holding the harness binaries
    #[arg(long = "local-bin-dir")]
    pub local_bin: Option<PathBuf>,

    /// Local xpcshell test tree
    #[arg(long = "xpc-dir")]
    pub xpc_dir: Option<PathBuf>,

    /// Application package to run the tests against
    #[arg(long = "apk")]
    pub package: Option<PathBuf>,

    /// Shared test modules directory
    #[arg(long = "testing-modules-dir")]
    pub modules_dir: Option<PathBuf>,

    /// Plugins directory copied into each test's temp directory
    #[arg(long = "plugins-path")]
    pub plugins_dir: Option<PathBuf>,

    /// Per-test timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Debugger to launch the harness under
    #[arg(long)]
    pub debugger: Option<String>,

    /// Arguments passed to the debugger
    #[arg(long = "debugger-args", allow_hyphen_values = true)]
    pub debugger_args: Option<String>,

    /// Symbols for crash analysis
    #[arg(long = "symbols-path")]
    pub symbols_path: Option<PathBuf>,

    /// minidump-stackwalk executable
    #[arg(long)]
    pub stackwalk: Option<PathBuf>,

    /// Reuse a device prepared by an earlier run
    #[arg(long = "no-setup")]
    pub no_setup: bool,

    /// Extra environment variable, NAME=VALUE (repeatable)
    #[arg(long = "setenv", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Extra preference, NAME=VALUE (repeatable)
    #[arg(long = "setpref", value_parser = parse_key_val)]
    pub prefs: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

impl RunCommand {
    fn apply_overrides(&self, config: &mut Config) {
        let harness = &mut config.harness;
        if self.objdir.is_some() {
            harness.objdir = self.objdir.clone();
        }
        if self.local_bin.is_some() {
            harness.local_bin = self.local_bin.clone();
        }
        if self.xpc_dir.is_some() {
            harness.xpc_dir = self.xpc_dir.clone();
        }
        if self.package.is_some() {
            harness.package = self.package.clone();
        }
        if self.modules_dir.is_some() {
            harness.modules_dir = self.modules_dir.clone();
        }
        if self.plugins_dir.is_some() {
            harness.plugins_dir = self.plugins_dir.clone();
        }
        if let Some(timeout) = self.timeout {
            harness.timeout = timeout;
        }
        if self.debugger.is_some() {
            harness.debugger = self.debugger.clone();
        }
        if let Some(ref args) = self.debugger_args {
            harness.debugger_args = args.split_whitespace().map(str::to_string).collect();
        }
        if self.symbols_path.is_some() {
            harness.symbols_path = self.symbols_path.clone();
        }
        if self.stackwalk.is_some() {
            harness.stackwalk = self.stackwalk.clone();
        }
        if self.no_setup {
            harness.setup = false;
        }
        for (name, value) in &self.env {
            config
                .env
                .insert(name.clone(), serde_yaml::Value::String(value.clone()));
        }
        for (name, value) in &self.prefs {
            config
                .prefs
                .insert(name.clone(), serde_yaml::Value::String(value.clone()));
        }
    }

    /// Runs the tests. Returns true if every test passed.
    pub fn execute(&self) -> Result<bool> {
        let mut config = self.device.load_config()?;
        self.apply_overrides(&mut config);
        let options = config.harness_options()?;

        let tests = load_tests(&self.manifest, &self.test_paths)?;
        if tests.is_empty() {
            return Err(anyhow!(
                "No tests selected from {}. Check the test list and --test-path filters.",
                self.manifest.display()
            ));
        }
        info!("Selected {} tests from {}", tests.len(), self.manifest.display());

        let (session, scripted) = self.device.connect(&config);
        let mut harness = RemoteHarness::new(options, session);
        let outcome = harness.run(&tests);

        if let Some(device) = scripted {
            print_dry_run(&device);
        }
        let summary = outcome.map_err(|e| explain(e, &config))?;

        println!();
        for result in &summary.results {
            let marker = match result.outcome {
                TestOutcome::Passed => "PASS",
                TestOutcome::Failed { .. } => "FAIL",
                TestOutcome::TimedOut => "TIMEOUT",
                TestOutcome::Crashed => "CRASH",
            };
            println!("  {:<8} {} ({}ms)", marker, result.name, result.duration.as_millis());
        }
        println!(
            "\n{} passed, {} failed",
            summary.passed(),
            summary.failed()
        );

        Ok(summary.all_passed())
    }
}
