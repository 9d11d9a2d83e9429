//! CLI command that reports what the harness would learn about a device.

use anyhow::Result;
use clap::Args;

use super::{explain, print_dry_run, DeviceArgs};
use xpcremote::device::{PROP_CPU_ABI, PROP_CPU_ABILIST, PROP_SDK_VERSION};
use xpcremote::remote::select_abi;

#[derive(Args, Debug)]
#[command(about = "Show the properties the harness reads from a device")]
pub struct DeviceInfoCommand {
    #[command(flatten)]
    pub device: DeviceArgs,
}

impl DeviceInfoCommand {
    pub fn execute(&self) -> Result<bool> {
        let config = self.device.load_config()?;
        let (session, scripted) = self.device.connect(&config);

        println!("Device");
        println!(
            "  Serial:        {}",
            session.device().serial().unwrap_or_else(|| "(default)".to_string())
        );
        println!("  Test root:     {}", session.test_root());

        let sdk = session
            .read_property(PROP_SDK_VERSION)
            .map_err(|e| explain(e, &config))?;
        let abilist = session
            .read_property(PROP_CPU_ABILIST)
            .map_err(|e| explain(e, &config))?;
        let abi = select_abi(&session, None).map_err(|e| explain(e, &config))?;

        println!("  SDK version:   {}", sdk.as_deref().unwrap_or("unknown"));
        println!("  {}: {}", PROP_CPU_ABI, abi);
        println!("  {}: {}", PROP_CPU_ABILIST, abilist.as_deref().unwrap_or("unknown"));

        if let Some(device) = scripted {
            print_dry_run(&device);
        }
        Ok(true)
    }
}
