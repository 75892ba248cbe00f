//! # Labvisor Node
//!
//! Hosts the orchestration core: wires the configured hypervisor backends
//! (behind a dispatcher when there is more than one), the VLAN pool and the
//! disk store, and exposes operator subcommands.
//!
//! ## Usage
//! ```bash
//! labvisor-node --config /etc/labvisor/node.yaml run --deploy lab.yaml
//! labvisor-node deploy lab.yaml --wait --teardown
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod commands;
mod config;
mod server;

use cli::{Args, Command};
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.json_logs {
        labvisor_common::init_logging_json(&args.log_level)?;
    } else {
        labvisor_common::init_logging(&args.log_level)?;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Labvisor Node");

    // Load configuration
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(&args)
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default().with_cli_overrides(&args)
            }
        },
    };
    config.validate()?;

    info!(
        backends = config.hypervisor.backends.len(),
        uplink = %config.hypervisor.uplink,
        vlan_start = config.hypervisor.vlan.start,
        vlan_end = config.hypervisor.vlan.end,
        "Node configured"
    );

    match args.command() {
        Command::Run { deploy } => {
            if let Err(e) = server::run(config, deploy).await {
                error!(error = %e, "Node failed");
                return Err(e);
            }
        }
        Command::Deploy {
            file,
            wait,
            teardown,
        } => {
            let outcome = commands::deploy(&config, &file, wait, teardown).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            outcome.deployment.ensure_complete()?;
        }
    }

    Ok(())
}
