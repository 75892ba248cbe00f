//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Labvisor Node - lab topology orchestration across hypervisor backends
#[derive(Parser, Debug)]
#[command(name = "labvisor-node")]
#[command(about = "Labvisor Node - lab topology orchestration across hypervisor backends")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "LABVISOR_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Override the backend keep-alive interval in seconds
    #[arg(long)]
    pub keep_alive_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Args {
    /// Subcommand to run; `run` when none is given.
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Run { deploy: Vec::new() })
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Keep backends alive until Ctrl-C, hosting the given deployments
    Run {
        /// Deployment context file to bring up at start and remove at exit
        #[arg(long = "deploy", value_name = "FILE")]
        deploy: Vec<PathBuf>,
    },
    /// Deploy a topology described in a YAML file
    Deploy {
        /// Deployment context file
        file: PathBuf,
        /// Wait for every member to reach running
        #[arg(long)]
        wait: bool,
        /// Tear the deployment down again once it is up
        #[arg(long)]
        teardown: bool,
    },
}
