//! Environment handed to every test process.
//!
//! The environment is assembled in a fixed order while the session is
//! prepared and then frozen. `EnvironmentBuilder` can only be written to;
//! readers (port forwarding, the wrapper script, the runner) get the frozen
//! `Environment` and so cannot observe a half-built one.

use crate::remote::abi::SelectedAbi;
use crate::remote::workspace::RemoteWorkspace;

pub const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";
pub const MOZ_LINKER_CACHE: &str = "MOZ_LINKER_CACHE";
pub const GRE_HOME: &str = "GRE_HOME";
pub const MOZ_ANDROID_DATA_DIR: &str = "MOZ_ANDROID_DATA_DIR";
pub const XPCSHELL_TEST_PROFILE_DIR: &str = "XPCSHELL_TEST_PROFILE_DIR";
pub const HOME: &str = "HOME";
pub const TMPDIR: &str = "TMPDIR";
pub const XPCSHELL_TEST_TEMP_DIR: &str = "XPCSHELL_TEST_TEMP_DIR";
pub const XPCSHELL_MINIDUMP_DIR: &str = "XPCSHELL_MINIDUMP_DIR";
pub const MOZ_FORCE_DISABLE_E10S: &str = "MOZ_FORCE_DISABLE_E10S";
pub const MOZ_ANDROID_CPU_ABI: &str = "MOZ_ANDROID_CPU_ABI";

/// Write-only accumulator for environment variables, in insertion order.
#[derive(Debug, Default)]
pub struct EnvironmentBuilder {
    vars: Vec<(String, String)>,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a variable, replacing an earlier value in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((name, value)),
        }
        self
    }

    /// Adds user-supplied variables.
    pub fn extend<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in vars {
            self.set(name, value);
        }
        self
    }

    /// Points library lookup, profile, temp and crash-dump locations at the
    /// remote workspace.
    pub fn workspace(&mut self, ws: &RemoteWorkspace) -> &mut Self {
        self.set(LD_LIBRARY_PATH, ws.bin.as_str())
            .set(MOZ_LINKER_CACHE, ws.bin.as_str())
            .set(GRE_HOME, ws.bin.as_str())
            .set(XPCSHELL_TEST_PROFILE_DIR, ws.profile.as_str())
            .set(TMPDIR, ws.tmp.as_str())
            .set(HOME, ws.profile.as_str())
            .set(XPCSHELL_TEST_TEMP_DIR, ws.tmp.as_str())
            .set(XPCSHELL_MINIDUMP_DIR, ws.minidumps.as_str())
            .set(MOZ_ANDROID_DATA_DIR, ws.bin.as_str())
            .set(MOZ_FORCE_DISABLE_E10S, "1")
    }

    pub fn abi(&mut self, abi: &SelectedAbi) -> &mut Self {
        self.set(MOZ_ANDROID_CPU_ABI, abi.as_str())
    }

    /// Freezes the accumulated variables.
    pub fn finalize(self) -> Environment {
        Environment { vars: self.vars }
    }
}

/// Finalized, read-only environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_variables() {
        let ws = RemoteWorkspace::new("/data/local/tmp/test_root");
        let mut builder = EnvironmentBuilder::new();
        builder.workspace(&ws).abi(&SelectedAbi::new("x86_64"));
        let env = builder.finalize();

        assert_eq!(env.get(LD_LIBRARY_PATH), Some(ws.bin.as_str()));
        assert_eq!(env.get(GRE_HOME), Some(ws.bin.as_str()));
        assert_eq!(env.get(HOME), Some(ws.profile.as_str()));
        assert_eq!(env.get(TMPDIR), Some(ws.tmp.as_str()));
        assert_eq!(env.get(XPCSHELL_MINIDUMP_DIR), Some(ws.minidumps.as_str()));
        assert_eq!(env.get(MOZ_FORCE_DISABLE_E10S), Some("1"));
        assert_eq!(env.get(MOZ_ANDROID_CPU_ABI), Some("x86_64"));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut builder = EnvironmentBuilder::new();
        builder.set("A", "1").set("B", "2").set("A", "3");
        let env = builder.finalize();

        let vars: Vec<_> = env.iter().collect();
        assert_eq!(vars, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn test_user_variables_kept_before_workspace() {
        let ws = RemoteWorkspace::new("/r");
        let mut builder = EnvironmentBuilder::new();
        builder.extend([("MOZHTTP2_PORT", "8443")]).workspace(&ws);
        let env = builder.finalize();

        assert_eq!(env.iter().next(), Some(("MOZHTTP2_PORT", "8443")));
        assert!(env.contains(GRE_HOME));
    }
}
