//! Device Manager - coordinate attached and networked Android devices
//!
//! This is the binary entry point. All engine logic lives in the workspace
//! crates; this file parses arguments and picks a headless runner.

mod headless;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use tracing::info;

use devmgr_app::config::load_settings_from;
use devmgr_app::signals::spawn_signal_handler;
use devmgr_app::Engine;
use devmgr_core::parse_since;
use devmgr_daemon::AdbTransport;

/// Device Manager - coordinate attached and networked Android devices
#[derive(Parser, Debug)]
#[command(name = "devmgr", version)]
#[command(about = "Coordinate attached and networked Android devices", long_about = None)]
struct Args {
    /// Path to config.toml (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch devices come and go, printing NDJSON events
    Watch,

    /// Stream logcat for a device
    Logs {
        serial: String,

        /// Only show entries from this time on ("MM-dd HH:mm:ss")
        #[arg(long, value_parser = parse_since_arg)]
        since: Option<NaiveDateTime>,
    },

    /// Run a helper script from the scripts directory
    Script {
        /// Run without the script timeout
        #[arg(long)]
        long_running: bool,

        serial: String,

        /// Script file name, e.g. screenshot.sh
        name: String,

        /// Extra arguments passed after the serial
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List devices with their details and exit
    Devices,
}

fn parse_since_arg(value: &str) -> Result<NaiveDateTime, String> {
    parse_since(value).ok_or_else(|| format!("expected \"MM-dd HH:mm:ss\", got \"{value}\""))
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    // Logs go to a file; stdout carries NDJSON
    devmgr_core::logging::init()?;

    let settings = load_settings_from(args.config.as_deref());
    let transport = Arc::new(AdbTransport::locate(&settings.adb.path)?);
    info!("Using adb at {}", transport.path().display());

    let engine = Engine::new(transport, settings);
    let shutdown = spawn_signal_handler();

    match args.command {
        Command::Watch => headless::runner::run_watch(&engine, shutdown).await?,
        Command::Logs { serial, since } => {
            headless::runner::run_logs(&engine, &serial, since, shutdown).await?
        }
        Command::Script {
            long_running,
            serial,
            name,
            args,
        } => {
            let success =
                headless::runner::run_script(&engine, &serial, &name, &args, long_running, shutdown)
                    .await?;
            if !success {
                std::process::exit(1);
            }
        }
        Command::Devices => headless::runner::run_devices(&engine).await?,
    }

    info!("Device Manager exiting");
    Ok(())
}
