//! Configuration management for xpcremote.
//!
//! Settings for the device connection and the local build under test are read
//! from a YAML file; command-line flags override individual values.
//!
//! # Configuration File Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/xpcremote/config.yml`
//! - macOS: `~/Library/Application Support/xpcremote/config.yml`
//! - Windows: `C:\Users\<User>\AppData\Roaming\xpcremote\config.yml`
//!
//! # Example Configuration
//!
//! ```yaml
//! device:
//!   adb_path: "/opt/android-sdk/platform-tools/adb"
//!   serial: "emulator-5554"
//!   test_root: "/data/local/tmp/test_root"
//! harness:
//!   objdir: "/home/me/src/obj-arm64"
//!   package: "/home/me/src/obj-arm64/dist/geckoview-test.apk"
//!   timeout: 300
//! env:
//!   MOZHTTP2_PORT: 8443
//! prefs:
//!   browser.dom.window.dump.enabled: true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::remote::deploy::HARNESS_BINARIES;

/// Default adb executable, looked up on PATH
const DEFAULT_ADB_PATH: &str = "adb";

/// Default device-root test path
const DEFAULT_TEST_ROOT: &str = "/data/local/tmp/test_root";

/// Default timeout for device commands in seconds
const DEFAULT_DEVICE_TIMEOUT: u64 = 300;

/// Default harness executable name
const DEFAULT_HARNESS: &str = "xpcshell";

/// Default per-test timeout in seconds
const DEFAULT_TEST_TIMEOUT: u64 = 300;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub harness: HarnessConfig,

    /// Extra environment variables for every test
    #[serde(default)]
    pub env: BTreeMap<String, serde_yaml::Value>,

    /// Preferences written to the remote `user.js`
    #[serde(default)]
    pub prefs: BTreeMap<String, serde_yaml::Value>,
}

/// How to reach the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path to the adb executable
    #[serde(default = "default_adb_path")]
    pub adb_path: String,

    /// Serial of the target device (optional when only one is attached)
    pub serial: Option<String>,

    /// Device-root test path
    #[serde(default = "default_test_root")]
    pub test_root: String,

    /// Timeout for device commands in seconds
    #[serde(default = "default_device_timeout")]
    pub timeout: u64,
}

/// Where the build under test lives and how tests are launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Build output directory
    pub objdir: Option<PathBuf>,

    /// Local directory holding the harness binaries (default: `<objdir>/dist/bin`)
    pub local_bin: Option<PathBuf>,

    /// Local test tree (default: `<objdir>/_tests/xpcshell`)
    pub xpc_dir: Option<PathBuf>,

    /// Harness head script (default: `head.js` in the test tree)
    pub head_js: Option<PathBuf>,

    /// Application package to run the tests against
    pub package: Option<PathBuf>,

    /// Shared test modules pushed to the device
    pub modules_dir: Option<PathBuf>,

    /// Plugins copied into each test's temp directory
    pub plugins_dir: Option<PathBuf>,

    /// Name of the harness executable
    #[serde(default = "default_harness")]
    pub harness: String,

    /// Binaries to push; empty means the standard set
    #[serde(default)]
    pub binaries: Vec<String>,

    /// Per-test timeout in seconds
    #[serde(default = "default_test_timeout")]
    pub timeout: u64,

    /// Debugger to launch the harness under
    pub debugger: Option<String>,

    #[serde(default)]
    pub debugger_args: Vec<String>,

    /// Symbols for crash analysis
    pub symbols_path: Option<PathBuf>,

    /// `minidump-stackwalk` executable
    pub stackwalk: Option<PathBuf>,

    /// Provision and deploy before running; disable to reuse a prepared device
    #[serde(default = "default_setup")]
    pub setup: bool,
}

fn default_adb_path() -> String {
    DEFAULT_ADB_PATH.to_string()
}

fn default_test_root() -> String {
    DEFAULT_TEST_ROOT.to_string()
}

fn default_device_timeout() -> u64 {
    DEFAULT_DEVICE_TIMEOUT
}

fn default_harness() -> String {
    DEFAULT_HARNESS.to_string()
}

fn default_test_timeout() -> u64 {
    DEFAULT_TEST_TIMEOUT
}

fn default_setup() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            serial: None,
            test_root: default_test_root(),
            timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            objdir: None,
            local_bin: None,
            xpc_dir: None,
            head_js: None,
            package: None,
            modules_dir: None,
            plugins_dir: None,
            harness: default_harness(),
            binaries: Vec::new(),
            timeout: DEFAULT_TEST_TIMEOUT,
            debugger: None,
            debugger_args: Vec::new(),
            symbols_path: None,
            stackwalk: None,
            setup: true,
        }
    }
}

impl DeviceConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Verified, fully resolved settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessOptions {
    pub local_bin: PathBuf,
    pub xpc_dir: PathBuf,
    pub head_js: PathBuf,
    pub local_package: Option<PathBuf>,
    /// Unpacked distribution tree used when no package is given
    pub dist_dir: Option<PathBuf>,
    pub modules_dir: Option<PathBuf>,
    pub plugins_dir: Option<PathBuf>,
    pub setup: bool,
    pub harness: String,
    pub binaries: Vec<String>,
    pub timeout: Duration,
    pub debugger: Option<String>,
    pub debugger_args: Vec<String>,
    pub symbols_path: Option<PathBuf>,
    pub stackwalk: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub prefs: Vec<(String, String)>,
}

impl Config {
    /// Returns the default configuration file path for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("xpcremote").join("config.yml"))
    }

    /// Loads configuration from the default location.
    ///
    /// Returns `Ok(Config::default())` if no config file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Config::default()),
        }
    }

    /// Loads configuration from a specific file path.
    ///
    /// Returns `Ok(Config::default())` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to read config file: {}\n\n\
                     File path: {}\n\n\
                     Suggestions:\n\
                     • Check file permissions: ls -la {}\n\
                     • Verify the file is readable",
                    e,
                    path.display(),
                    path.display()
                ),
            ))
        })?;

        let config: Config = serde_yaml::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file: {}\n\n\
                 File path: {}\n\n\
                 Suggestions:\n\
                 • Check YAML syntax in the config file\n\
                 • Verify indentation uses spaces, not tabs\n\n\
                 Example valid config:\n\
                 device:\n\
                   serial: \"emulator-5554\"\n\
                 harness:\n\
                   objdir: \"/path/to/objdir\"",
                e,
                path.display()
            ))
        })?;

        Ok(config)
    }

    /// Resolves and verifies the harness settings against the local
    /// filesystem.
    pub fn harness_options(&self) -> Result<HarnessOptions> {
        let harness = &self.harness;
        let objdir = harness.objdir.as_deref();

        let local_bin = match (&harness.local_bin, objdir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(objdir)) => objdir.join("dist").join("bin"),
            (None, None) => {
                return Err(Error::Config(
                    "Couldn't find local binary dir, specify --local-bin-dir or --objdir".to_string(),
                ))
            }
        };
        if !local_bin.is_dir() {
            return Err(Error::Config(format!(
                "Couldn't find local binary dir {}, specify --local-bin-dir",
                local_bin.display()
            )));
        }

        let xpc_dir = match (&harness.xpc_dir, objdir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(objdir)) => objdir.join("_tests").join("xpcshell"),
            (None, None) => {
                return Err(Error::Config(
                    "Couldn't find local xpcshell test directory, specify --xpc-dir or --objdir"
                        .to_string(),
                ))
            }
        };
        if !xpc_dir.is_dir() {
            return Err(Error::Config(format!(
                "Couldn't find local xpcshell test directory {}",
                xpc_dir.display()
            )));
        }

        if let Some(ref package) = harness.package {
            if !package.is_file() {
                return Err(Error::Config(format!(
                    "Package {} does not exist",
                    package.display()
                )));
            }
        }

        let binaries = if harness.binaries.is_empty() {
            HARNESS_BINARIES.iter().map(|b| b.to_string()).collect()
        } else {
            harness.binaries.clone()
        };

        Ok(HarnessOptions {
            head_js: harness
                .head_js
                .clone()
                .unwrap_or_else(|| xpc_dir.join("head.js")),
            local_bin,
            xpc_dir,
            local_package: harness.package.clone(),
            dist_dir: objdir.map(|o| o.join("dist").join("b2g")),
            modules_dir: harness.modules_dir.clone(),
            plugins_dir: harness.plugins_dir.clone(),
            setup: harness.setup,
            harness: harness.harness.clone(),
            binaries,
            timeout: Duration::from_secs(harness.timeout),
            debugger: harness.debugger.clone(),
            debugger_args: harness.debugger_args.clone(),
            symbols_path: harness.symbols_path.clone(),
            stackwalk: harness.stackwalk.clone(),
            env: scalar_pairs(&self.env, "env")?,
            prefs: scalar_pairs(&self.prefs, "prefs")?,
        })
    }
}

fn scalar_pairs(map: &BTreeMap<String, serde_yaml::Value>, section: &str) -> Result<Vec<(String, String)>> {
    map.iter()
        .map(|(name, value)| Ok((name.clone(), scalar_to_string(value, section, name)?)))
        .collect()
}

/// Renders a YAML scalar as the string a shell or `user.js` would see.
fn scalar_to_string(value: &serde_yaml::Value, section: &str, name: &str) -> Result<String> {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(Error::Config(format!(
            "{}.{} must be a string, number or boolean",
            section, name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn objdir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("dist/bin")).unwrap();
        fs::create_dir_all(dir.path().join("_tests/xpcshell")).unwrap();
        dir
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.device.adb_path, "adb");
        assert_eq!(config.device.test_root, "/data/local/tmp/test_root");
        assert_eq!(config.harness.harness, "xpcshell");
        assert!(config.harness.setup);
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.yml")).unwrap();
        assert_eq!(config.device, DeviceConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "device:\n  serial: emulator-5554\nenv:\n  MOZHTTP2_PORT: 8443\nprefs:\n  a.b: true\n  c.d: en-US\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.device.serial.as_deref(), Some("emulator-5554"));
        assert_eq!(config.device.timeout, 300);
        assert_eq!(config.harness.timeout, 300);
        assert_eq!(
            scalar_pairs(&config.env, "env").unwrap(),
            vec![("MOZHTTP2_PORT".to_string(), "8443".to_string())]
        );
        assert_eq!(
            scalar_pairs(&config.prefs, "prefs").unwrap(),
            vec![
                ("a.b".to_string(), "true".to_string()),
                ("c.d".to_string(), "en-US".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "device: [").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_options_derive_from_objdir() {
        let obj = objdir();
        let mut config = Config::default();
        config.harness.objdir = Some(obj.path().to_path_buf());

        let options = config.harness_options().unwrap();
        assert_eq!(options.local_bin, obj.path().join("dist/bin"));
        assert_eq!(options.xpc_dir, obj.path().join("_tests/xpcshell"));
        assert_eq!(options.head_js, obj.path().join("_tests/xpcshell/head.js"));
        assert_eq!(options.dist_dir, Some(obj.path().join("dist/b2g")));
        assert_eq!(options.binaries.len(), HARNESS_BINARIES.len());
        assert_eq!(options.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_options_require_local_bin() {
        assert!(matches!(
            Config::default().harness_options(),
            Err(Error::Config(_))
        ));

        let obj = objdir();
        fs::remove_dir_all(obj.path().join("dist/bin")).unwrap();
        let mut config = Config::default();
        config.harness.objdir = Some(obj.path().to_path_buf());
        let err = config.harness_options().unwrap_err();
        assert!(err.to_string().contains("local binary dir"));
    }

    #[test]
    fn test_options_reject_missing_package() {
        let obj = objdir();
        let mut config = Config::default();
        config.harness.objdir = Some(obj.path().to_path_buf());
        config.harness.package = Some(obj.path().join("missing.apk"));
        assert!(matches!(config.harness_options(), Err(Error::Config(_))));
    }

    #[test]
    fn test_nested_env_value_rejected() {
        let mut config = Config::default();
        config
            .env
            .insert("BAD".to_string(), serde_yaml::from_str("[1, 2]").unwrap());
        assert!(scalar_pairs(&config.env, "env").is_err());
    }
}
