//! Remote test execution on an Android device.
//!
//! This module provisions the remote workspace, deploys the harness and its
//! native libraries, maps local test directories to their remote mirrors and
//! runs each test as a process on the device.

pub mod abi;
pub mod archive;
pub mod crash;
pub mod deploy;
pub mod env;
pub mod orchestrator;
pub mod paths;
pub mod ports;
pub mod runner;
pub mod workspace;

pub use abi::{choose_abi, select_abi, SelectedAbi};
pub use archive::{PackageArchive, ZipPackage};
pub use crash::{CrashAnalyzer, CrashReport, StackwalkAnalyzer};
pub use deploy::{generate_wrapper, ArtifactDeployer, HARNESS_BINARIES};
pub use env::{Environment, EnvironmentBuilder};
pub use orchestrator::{RemoteHarness, RunSummary};
pub use paths::{PathMapping, PathTranslator};
pub use ports::PortForwardingManager;
pub use runner::{
    MozInfo, ProcessHandle, ProcessState, RunnerOptions, TestOutcome, TestFiles,
    TestProcessRunner, TestResult, TimeoutSignal, UNKNOWN_FAILURE,
};
pub use workspace::{RemoteWorkspace, WorkspaceProvisioner};
