use clap::{Parser, Subcommand};
use std::process::ExitCode;

mod cli;

use cli::device_info::DeviceInfoCommand;
use cli::run::RunCommand;

#[derive(Parser)]
#[command(name = "xpcremote")]
#[command(about = "Run xpcshell test suites on a remote Android device over adb", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunCommand),
    DeviceInfo(DeviceInfoCommand),
}

fn main() -> ExitCode {
    // Initialize logging with INFO level by default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(cmd) => cmd.execute(),
        Commands::DeviceInfo(cmd) => cmd.execute(),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
