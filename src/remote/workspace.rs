//! Remote workspace layout and provisioning.
//!
//! Directory names are deliberately terse ("c" for components, "p" for the
//! profile): adb limits the length of a shell command line and every remote
//! path ends up on the per-test command line.

use crate::device::{remote_join, DeviceSession};
use crate::error::Result;
use log::{debug, info};

/// Fixed set of remote directories used during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWorkspace {
    pub root: String,
    pub scripts: String,
    pub components: String,
    pub modules: String,
    pub bin: String,
    pub tmp: String,
    pub profile: String,
    pub minidumps: String,
}

impl RemoteWorkspace {
    /// Derives every workspace path from the device-root test path.
    pub fn new(test_root: &str) -> Self {
        let root = remote_join(test_root, "xpc");
        Self {
            scripts: remote_join(&root, "s"),
            components: remote_join(&root, "c"),
            modules: remote_join(&root, "m"),
            bin: remote_join(&root, "bin"),
            tmp: remote_join(&root, "tmp"),
            profile: remote_join(&root, "p"),
            minidumps: remote_join(&root, "minidumps"),
            root,
        }
    }

    /// Directory holding extra default preferences next to the binaries.
    pub fn extra_prefs(&self) -> String {
        remote_join(&self.bin, "defaults/pref/extra")
    }

    /// Path of the generated launcher script.
    pub fn wrapper(&self) -> String {
        remote_join(&self.bin, "xpcw")
    }

    /// Path of the shared test harness head script.
    pub fn head_js(&self) -> String {
        remote_join(&self.scripts, "head.js")
    }

    /// Path of the shared preferences file.
    pub fn prefs_file(&self) -> String {
        remote_join(&self.root, "user.js")
    }
}

/// Creates and clears the remote directory skeleton.
pub struct WorkspaceProvisioner<'a> {
    session: &'a DeviceSession,
    workspace: &'a RemoteWorkspace,
}

impl<'a> WorkspaceProvisioner<'a> {
    pub fn new(session: &'a DeviceSession, workspace: &'a RemoteWorkspace) -> Self {
        Self { session, workspace }
    }

    /// Removes `path` if present and recreates it empty.
    pub fn init_dir(&self, path: &str) -> Result<()> {
        debug!("Initializing remote directory {}", path);
        self.session.rm(path, true, true)?;
        self.session.mkdir(path)
    }

    /// Recreates the whole skeleton, in the order deployment depends on.
    pub fn provision(&self) -> Result<()> {
        info!("Provisioning remote workspace under {}", self.workspace.root);
        let ws = self.workspace;
        self.init_dir(&ws.tmp)?;
        self.init_dir(&ws.bin)?;
        self.init_dir(&ws.extra_prefs())?;
        self.init_dir(&ws.components)?;
        self.init_dir(&ws.scripts)?;
        self.init_dir(&ws.minidumps)?;
        self.init_dir(&ws.profile)?;
        Ok(())
    }

    /// Clears collected crash dumps.
    pub fn reset_minidumps(&self) -> Result<()> {
        self.init_dir(&self.workspace.minidumps)
    }

    /// Clears per-test scratch state: temp and profile directories.
    pub fn reset_test_state(&self) -> Result<()> {
        self.init_dir(&self.workspace.tmp)?;
        self.init_dir(&self.workspace.profile)
    }
}
