//! Session-level orchestration of a remote test run.
//!
//! `RemoteHarness` drives the fixed order a session needs: provision and
//! deploy, select the ABI, finalize the environment, register path mappings,
//! forward ports, push the wrapper, then run every test sequentially.

use crate::config::HarnessOptions;
use crate::device::{remote_join, DeviceSession, PROP_SDK_VERSION};
use crate::error::{Error, Result};
use crate::manifest::TestDescriptor;
use crate::remote::abi::{select_abi, SelectedAbi};
use crate::remote::archive::{PackageArchive, ZipPackage};
use crate::remote::crash::{CrashAnalyzer, StackwalkAnalyzer};
use crate::remote::deploy::ArtifactDeployer;
use crate::remote::env::{Environment, EnvironmentBuilder};
use crate::remote::paths::{normalize, PathTranslator};
use crate::remote::ports::PortForwardingManager;
use crate::remote::runner::{
    MozInfo, RunnerOptions, TestOutcome, TestProcessRunner, TestResult, UNKNOWN_FAILURE,
};
use crate::remote::workspace::{RemoteWorkspace, WorkspaceProvisioner};
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// State established by `prepare` and needed by every later step.
#[derive(Debug, Clone)]
struct PreparedSession {
    abi: SelectedAbi,
    env: Environment,
    remote_package: Option<String>,
    prefs_file: Option<String>,
}

/// Aggregate of a run.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub results: Vec<TestResult>,
}

impl RunSummary {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_pass()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    /// True only if at least one test ran and none failed.
    pub fn all_passed(&self) -> bool {
        !self.results.is_empty() && self.failed() == 0
    }

    /// Process exit status for the run: 0 when every test passed, else 1.
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }

    pub fn duration(&self) -> Duration {
        self.results.iter().map(|r| r.duration).sum()
    }
}

/// Runs a test list on one device.
pub struct RemoteHarness {
    options: HarnessOptions,
    session: DeviceSession,
    workspace: RemoteWorkspace,
    translator: PathTranslator,
    ports: PortForwardingManager,
    analyzer: Box<dyn CrashAnalyzer>,
    prepared: Option<PreparedSession>,
}

impl RemoteHarness {
    pub fn new(options: HarnessOptions, session: DeviceSession) -> Self {
        let workspace = RemoteWorkspace::new(session.test_root());
        let analyzer = Box::new(StackwalkAnalyzer::new(options.stackwalk.clone()));
        Self {
            options,
            session,
            workspace,
            translator: PathTranslator::new(),
            ports: PortForwardingManager::new(),
            analyzer,
            prepared: None,
        }
    }

    /// Replaces the crash analyzer.
    pub fn with_analyzer(mut self, analyzer: Box<dyn CrashAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn workspace(&self) -> &RemoteWorkspace {
        &self.workspace
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn selected_abi(&self) -> Option<&SelectedAbi> {
        self.prepared.as_ref().map(|p| &p.abi)
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.prepared.as_ref().map(|p| &p.env)
    }

    fn prepared(&self) -> Result<&PreparedSession> {
        self.prepared
            .as_ref()
            .ok_or_else(|| Error::Provisioning("remote harness has not been prepared".to_string()))
    }

    fn open_package(&self) -> Result<Option<ZipPackage>> {
        self.options
            .local_package
            .as_deref()
            .map(ZipPackage::open)
            .transpose()
    }

    fn remote_package_path(&self) -> Option<String> {
        let package = self.options.local_package.as_ref()?;
        let name = package.file_name()?.to_string_lossy();
        Some(remote_join(&self.workspace.bin, &name))
    }

    /// Provisions the workspace and deploys artifacts (when setup is enabled),
    /// selects the ABI and finalizes the environment.
    pub fn prepare(&mut self) -> Result<()> {
        let mut package = self.open_package()?;
        let provisioner = WorkspaceProvisioner::new(&self.session, &self.workspace);
        let deployer = ArtifactDeployer::new(&self.session, &self.workspace);

        let mut prefs_file = None;
        let abi = if self.options.setup {
            provisioner.provision()?;
            deployer.deploy_test_tree(&self.options.xpc_dir)?;
            deployer.deploy_head_script(&self.options.head_js)?;

            let names: Vec<&str> = self.options.binaries.iter().map(String::as_str).collect();
            let binaries = deployer.deploy_harness_binaries(&self.options.local_bin, &names)?;
            info!(
                "Pushed {} harness binaries ({} missing)",
                binaries.pushed.len(),
                binaries.missing.len()
            );
            deployer.deploy_support_component(&self.options.local_bin)?;

            let abi = match (self.options.local_package.as_deref(), package.as_mut()) {
                (Some(local), Some(package)) => deployer.deploy_package(local, package)?.abi,
                _ => {
                    let dist = self
                        .options
                        .dist_dir
                        .as_deref()
                        .filter(|dir| dir.exists())
                        .ok_or_else(|| {
                            Error::Provisioning(
                                "no runnable target: no package and no distribution tree".to_string(),
                            )
                        })?;
                    deployer.deploy_distribution(dist)?;
                    select_abi(&self.session, None)?
                }
            };

            deployer.deploy_modules(self.options.modules_dir.as_deref())?;
            if !self.options.prefs.is_empty() {
                prefs_file = Some(deployer.deploy_prefs(&self.options.prefs)?);
            }
            abi
        } else {
            provisioner.reset_minidumps()?;
            select_abi(
                &self.session,
                package.as_ref().map(|p| p as &dyn PackageArchive),
            )?
        };

        let mut builder = EnvironmentBuilder::new();
        builder
            .extend(self.options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .workspace(&self.workspace)
            .abi(&abi);
        let env = builder.finalize();
        info!("Using env {:?}", env.iter().collect::<Vec<_>>());

        self.prepared = Some(PreparedSession {
            abi,
            env,
            remote_package: self.remote_package_path(),
            prefs_file,
        });
        Ok(())
    }

    /// Registers one path mapping per distinct test directory, then performs
    /// the steps that need the finalized environment: port forwarding and
    /// the wrapper push.
    pub fn register_tests(&mut self, tests: &[TestDescriptor]) -> Result<()> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| Error::Provisioning("remote harness has not been prepared".to_string()))?;

        let unique_dirs: BTreeSet<&Path> = tests.iter().map(|t| t.here.as_path()).collect();
        for dir in unique_dirs {
            match relative_test_dir(dir, &self.options.xpc_dir) {
                Some(relative) => {
                    let remote = remote_join(&self.workspace.scripts, &relative);
                    self.translator.register(dir, &remote);
                }
                None => warn!(
                    "{} is outside {}; its tests run from their local path",
                    dir.display(),
                    self.options.xpc_dir.display()
                ),
            }
        }

        self.ports.setup(&self.session, &prepared.env)?;
        if self.options.setup {
            ArtifactDeployer::new(&self.session, &self.workspace)
                .push_wrapper(&prepared.env, &self.options.harness)?;
        }
        Ok(())
    }

    fn mozinfo(&self, abi: &SelectedAbi) -> Result<MozInfo> {
        let android_version = self.session.read_property(PROP_SDK_VERSION)?;
        let serial = self.session.device().serial();
        Ok(MozInfo::new(android_version, serial.as_deref(), abi.as_str()))
    }

    /// Runs the tests one at a time.
    ///
    /// A test whose launch fails for a reason other than device loss is
    /// recorded as failed and the run continues; losing the device aborts.
    pub fn run_tests(&self, tests: &[TestDescriptor]) -> Result<RunSummary> {
        let prepared = self.prepared()?;
        let options = RunnerOptions {
            harness: self.options.harness.clone(),
            timeout: self.options.timeout,
            debugger: self.options.debugger.clone(),
            debugger_args: self.options.debugger_args.clone(),
            remote_package: prepared.remote_package.clone(),
            prefs_file: prepared.prefs_file.clone(),
            prefs: self.options.prefs.clone(),
            plugins_dir: self.options.plugins_dir.clone(),
            symbols_path: self.options.symbols_path.clone(),
            mozinfo: self.mozinfo(&prepared.abi)?,
        };
        let runner = TestProcessRunner::new(
            &self.session,
            &self.workspace,
            &self.translator,
            &prepared.env,
            self.analyzer.as_ref(),
            options,
        );

        let mut summary = RunSummary::default();
        for test in tests {
            match runner.run_test(test) {
                Ok(result) => summary.results.push(result),
                Err(e) if e.is_device_lost() => {
                    error!("Aborting run, device lost during {}: {}", test.name, e);
                    return Err(e);
                }
                Err(e) => {
                    error!("TEST-UNEXPECTED-FAIL | {} | {}", test.name, e);
                    summary.results.push(TestResult {
                        name: test.name.clone(),
                        outcome: TestOutcome::Failed {
                            exit_code: UNKNOWN_FAILURE,
                        },
                        duration: Duration::ZERO,
                        output: e.to_string(),
                    });
                }
            }
        }

        if summary.results.is_empty() {
            error!("No tests run. Check the test list and --test-path filters.");
        }
        info!(
            "INFO | Passed: {} | Failed: {} | took {}ms",
            summary.passed(),
            summary.failed(),
            summary.duration().as_millis()
        );
        Ok(summary)
    }

    /// Full session: prepare, register and run.
    pub fn run(&mut self, tests: &[TestDescriptor]) -> Result<RunSummary> {
        self.prepare()?;
        self.register_tests(tests)?;
        self.run_tests(tests)
    }
}

/// Path of `dir` relative to the local test tree, with forward slashes.
fn relative_test_dir(dir: &Path, xpc_dir: &Path) -> Option<String> {
    let dir = normalize(dir);
    let root = normalize(xpc_dir);
    let relative = dir.strip_prefix(&root).ok()?;
    Some(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
    )
}
