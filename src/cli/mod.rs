pub mod device_info;
pub mod run;

use anyhow::{anyhow, Result};
use clap::Args;
use std::path::PathBuf;
use std::rc::Rc;

use xpcremote::config::Config;
use xpcremote::device::{
    diagnose_adb_error, AdbDevice, DeviceSession, ScriptedDevice, PROP_CPU_ABI, PROP_CPU_ABILIST,
    PROP_SDK_VERSION,
};
use xpcremote::error::Error;

/// Options shared by every command that talks to a device.
#[derive(Args, Debug, Clone, Default)]
pub struct DeviceArgs {
    /// Configuration file (default: platform config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the adb executable
    #[arg(long)]
    pub adb: Option<String>,

    /// Serial of the target device
    #[arg(long = "device-serial")]
    pub serial: Option<String>,

    /// Device-root test path
    #[arg(long = "remote-test-root")]
    pub test_root: Option<String>,

    /// Show what would be done against a simulated device
    #[arg(long)]
    pub dry_run: bool,
}

impl DeviceArgs {
    /// Loads the configuration file and applies device overrides.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match self.config {
            Some(ref path) => {
                if !path.exists() {
                    return Err(anyhow!("Config file not found: {}", path.display()));
                }
                Config::load_from(path)?
            }
            None => Config::load()?,
        };

        if let Some(ref adb) = self.adb {
            config.device.adb_path = adb.clone();
        }
        if let Some(ref serial) = self.serial {
            config.device.serial = Some(serial.clone());
        }
        if let Some(ref test_root) = self.test_root {
            config.device.test_root = test_root.clone();
        }
        Ok(config)
    }

    /// Opens a session on the configured device, or on a simulated one for
    /// `--dry-run`. The simulated device is returned so its calls can be
    /// printed afterwards.
    pub fn connect(&self, config: &Config) -> (DeviceSession, Option<Rc<ScriptedDevice>>) {
        let test_root = config.device.test_root.clone();
        if self.dry_run {
            let device = Rc::new(ScriptedDevice::with_serial(
                config.device.serial.clone().unwrap_or_else(|| "dry-run".to_string()),
            ));
            device.script_property(PROP_CPU_ABI, &["arm64-v8a"]);
            device.script_property(PROP_CPU_ABILIST, &["arm64-v8a,armeabi-v7a"]);
            device.script_property(PROP_SDK_VERSION, &["30"]);
            let session = DeviceSession::new(Box::new(device.clone()), test_root);
            return (session, Some(device));
        }

        let device = AdbDevice::new(config.device.adb_path.clone(), config.device.serial.clone())
            .with_default_timeout(config.device.command_timeout());
        (DeviceSession::new(Box::new(device), test_root), None)
    }
}

/// Prints every primitive a simulated device received.
pub fn print_dry_run(device: &ScriptedDevice) {
    println!("\n[DRY RUN] Device calls:");
    for call in device.calls() {
        println!("  {}", call);
    }
}

/// Attaches adb troubleshooting hints to device errors.
pub fn explain(error: Error, config: &Config) -> anyhow::Error {
    match error {
        Error::Device(ref message) | Error::DeviceLost(ref message) => anyhow!(diagnose_adb_error(
            message,
            &config.device.adb_path,
            config.device.serial.as_deref()
        )),
        other => other.into(),
    }
}
