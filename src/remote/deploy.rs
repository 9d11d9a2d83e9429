//! Deployment of harness binaries, libraries and support files.
//!
//! Everything the harness needs on the device is pushed here: the harness
//! executable and its helper servers, the `httpd.js` support component, the
//! application package and the native libraries matching the selected ABI
//! (or an unpacked distribution tree), shared modules, preferences, and the
//! `xpcw` launcher script.

use crate::device::{remote_join, DeviceSession};
use crate::error::{Error, Result};
use crate::remote::abi::{select_abi, SelectedAbi};
use crate::remote::archive::PackageArchive;
use crate::remote::env::Environment;
use crate::remote::workspace::RemoteWorkspace;
use log::{debug, info, warn};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

/// Binaries the harness needs; all but the harness itself are optional.
pub const HARNESS_BINARIES: &[&str] = &[
    "xpcshell",
    "ssltunnel",
    "certutil",
    "pk12util",
    "BadCertAndPinningServer",
    "DelegatedCredentialsServer",
    "OCSPStaplingServer",
    "GenerateOCSPResponse",
    "SanctionsTestServer",
];

/// The test tree holds thousands of files; a slow emulator needs longer
/// than the default device timeout to receive it.
pub const TEST_TREE_PUSH_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of pushing the harness binaries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BinaryDeployment {
    pub pushed: Vec<String>,
    pub missing: Vec<String>,
}

/// Outcome of deploying an application package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDeployment {
    /// Remote location of the package
    pub remote_path: String,
    /// ABI whose libraries were selected
    pub abi: SelectedAbi,
    /// Number of native libraries pushed
    pub libraries: usize,
}

/// Pushes artifacts into a provisioned workspace.
pub struct ArtifactDeployer<'a> {
    session: &'a DeviceSession,
    workspace: &'a RemoteWorkspace,
}

impl<'a> ArtifactDeployer<'a> {
    pub fn new(session: &'a DeviceSession, workspace: &'a RemoteWorkspace) -> Self {
        Self { session, workspace }
    }

    /// Pushes a file and makes it executable.
    fn push_executable(&self, local: &Path, remote: &str) -> Result<()> {
        self.session.push(local, remote)?;
        self.session.chmod(remote, false)
    }

    /// Mirrors the local test tree into the scripts directory.
    pub fn deploy_test_tree(&self, local_dir: &Path) -> Result<()> {
        info!("pushing {}", local_dir.display());
        let scripts = &self.workspace.scripts;
        self.session.rm(scripts, true, true)?;
        self.session
            .push_dir(local_dir, scripts, Some(TEST_TREE_PUSH_TIMEOUT))?;
        self.session.chmod(scripts, true)
    }

    /// Pushes the shared `head.js` into the scripts directory.
    pub fn deploy_head_script(&self, local: &Path) -> Result<()> {
        if !local.is_file() {
            return Err(Error::Provisioning(format!(
                "harness head script not found: {}",
                local.display()
            )));
        }
        self.push_executable(local, &self.workspace.head_js())
    }

    /// Pushes every named binary found in `local_bin`. Missing binaries are
    /// reported, not fatal.
    pub fn deploy_harness_binaries(&self, local_bin: &Path, names: &[&str]) -> Result<BinaryDeployment> {
        let mut report = BinaryDeployment::default();
        for name in names {
            let local = local_bin.join(name);
            if local.is_file() {
                info!("Pushing {}..", name);
                self.push_executable(&local, &remote_join(&self.workspace.bin, name))?;
                report.pushed.push(name.to_string());
            } else {
                warn!("*** Expected binary {} not found in {}!", name, local_bin.display());
                report.missing.push(name.to_string());
            }
        }
        Ok(report)
    }

    /// Pushes the `httpd.js` support component.
    pub fn deploy_support_component(&self, local_bin: &Path) -> Result<()> {
        let local = local_bin.join("components").join("httpd.js");
        let remote = remote_join(&self.workspace.components, "httpd.js");
        self.push_executable(&local, &remote)
    }

    /// Pushes an application package, selects the ABI and deploys the
    /// package's native libraries next to the harness.
    pub fn deploy_package(&self, local_package: &Path, package: &mut dyn PackageArchive) -> Result<PackageDeployment> {
        let file_name = local_package
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                Error::Provisioning(format!("invalid package path: {}", local_package.display()))
            })?;
        let remote_path = remote_join(&self.workspace.bin, &file_name);
        info!("Pushing package {}..", file_name);
        self.push_executable(local_package, &remote_path)?;

        let abi = select_abi(self.session, Some(&*package))?;
        let libraries = self.push_libs(package)?;
        info!("Pushed {} native libraries", libraries);

        Ok(PackageDeployment {
            remote_path,
            abi,
            libraries,
        })
    }

    /// Extracts every shared library in the package and pushes it to bin.
    pub fn push_libs(&self, package: &mut dyn PackageArchive) -> Result<usize> {
        let scratch = TempDir::new()?;
        let mut pushed = 0;
        for name in package.entry_names() {
            if !name.ends_with(".so") {
                continue;
            }
            info!("Pushing {}..", name);
            let base = name.rsplit('/').next().unwrap_or(&name);
            let local = package.extract(&name, scratch.path())?;
            self.push_executable(&local, &remote_join(&self.workspace.bin, base))?;
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Pushes an unpacked distribution tree wholesale into bin.
    pub fn deploy_distribution(&self, dist_dir: &Path) -> Result<()> {
        info!("Pushing distribution {}", dist_dir.display());
        self.session.push_dir(dist_dir, &self.workspace.bin, None)?;
        self.session.chmod(&self.workspace.bin, true)
    }

    /// Pushes the shared test modules directory, if one is configured.
    pub fn deploy_modules(&self, modules_dir: Option<&Path>) -> Result<bool> {
        let Some(dir) = modules_dir else {
            return Ok(false);
        };
        info!("Pushing modules {}", dir.display());
        self.session.push_dir(dir, &self.workspace.modules, None)?;
        self.session.chmod(&self.workspace.modules, true)?;
        Ok(true)
    }

    /// Writes preferences to `user.js` at the workspace root.
    pub fn deploy_prefs(&self, prefs: &[(String, String)]) -> Result<String> {
        let remote = self.workspace.prefs_file();
        push_contents(self.session, render_prefs(prefs)?.as_bytes(), &remote)?;
        Ok(remote)
    }

    /// Generates and pushes the `xpcw` launcher.
    pub fn push_wrapper(&self, env: &Environment, harness: &str) -> Result<String> {
        let remote = self.workspace.wrapper();
        let script = generate_wrapper(env, &self.workspace.bin, harness);
        debug!("Wrapper script:\n{}", script);
        push_contents(self.session, script.as_bytes(), &remote)?;
        Ok(remote)
    }
}

/// Renders the launcher script.
///
/// adb caps the length of a shell command line, so instead of repeating the
/// environment and executable path for every test the wrapper applies them
/// and a test is launched as `xpcw <cwd> <args...>`.
pub fn generate_wrapper(env: &Environment, bin_dir: &str, harness: &str) -> String {
    let mut script = String::from("#!/system/bin/sh\n");
    for (name, value) in env.iter() {
        script.push_str(&format!("export {}={}\n", name, crate::device::quote_arg(value)));
    }
    script.push_str("cd $1\n");
    script.push_str("echo xpcw: cd $1\n");
    script.push_str("shift\n");
    script.push_str(&format!("echo xpcw: {} \"$@\"\n", harness));
    script.push_str(&format!("{} \"$@\"\n", remote_join(bin_dir, harness)));
    script
}

/// Renders `user_pref` lines. Booleans and integers are written bare,
/// everything else as a string literal.
pub fn render_prefs(prefs: &[(String, String)]) -> Result<String> {
    let mut out = String::new();
    for (name, value) in prefs {
        let literal = if value == "true" || value == "false" || value.parse::<i64>().is_ok() {
            value.clone()
        } else {
            serde_json::to_string(value)?
        };
        out.push_str(&format!("user_pref({}, {});\n", serde_json::to_string(name)?, literal));
    }
    Ok(out)
}

/// Writes `contents` to a temporary file and pushes it to `remote`.
pub fn push_contents(session: &DeviceSession, contents: &[u8], remote: &str) -> Result<()> {
    let mut local = NamedTempFile::new()?;
    local.write_all(contents)?;
    local.flush()?;
    session.push(local.path(), remote)?;
    session.chmod(remote, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::env::EnvironmentBuilder;

    #[test]
    fn test_generate_wrapper() {
        let mut builder = EnvironmentBuilder::new();
        builder.set("GRE_HOME", "/r/xpc/bin").set("MOZ_FORCE_DISABLE_E10S", "1");
        let script = generate_wrapper(&builder.finalize(), "/r/xpc/bin", "xpcshell");

        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/system/bin/sh");
        assert_eq!(lines[1], "export GRE_HOME=/r/xpc/bin");
        assert_eq!(lines[2], "export MOZ_FORCE_DISABLE_E10S=1");
        assert_eq!(lines[3], "cd $1");
        assert_eq!(lines[5], "shift");
        assert_eq!(*lines.last().unwrap(), "/r/xpc/bin/xpcshell \"$@\"");
    }

    #[test]
    fn test_wrapper_quotes_values_with_spaces() {
        let mut builder = EnvironmentBuilder::new();
        builder.set("MOZ_LOG", "timestamp,sync nsHttp:5");
        let script = generate_wrapper(&builder.finalize(), "/b", "xpcshell");
        assert!(script.contains("export MOZ_LOG='timestamp,sync nsHttp:5'\n"));
    }

    #[test]
    fn test_render_prefs() {
        let prefs = vec![
            ("browser.dom.window.dump.enabled".to_string(), "true".to_string()),
            ("network.http.max-connections".to_string(), "16".to_string()),
            ("intl.locale.requested".to_string(), "en-US".to_string()),
        ];
        let rendered = render_prefs(&prefs).unwrap();
        assert_eq!(
            rendered,
            "user_pref(\"browser.dom.window.dump.enabled\", true);\n\
             user_pref(\"network.http.max-connections\", 16);\n\
             user_pref(\"intl.locale.requested\", \"en-US\");\n"
        );
    }
}
