use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cfdev", about = "Run a local Cloud Foundry development VM")]
pub struct Cli {
    /// Path to config file (default: <home>/cfdev.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Auto, global = true)]
    pub output: OutputFormat,

    /// Show debug logs on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only report the final outcome
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Interactive on a terminal, plain otherwise
    Auto,
    Interactive,
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch assets, boot the VM and deploy onto it
    Start {
        /// Number of vCPUs (overrides config)
        #[arg(long)]
        cpus: Option<u32>,

        /// Memory, e.g. 8192, 8G, 6144M (overrides config)
        #[arg(long, value_parser = parse_memory)]
        memory: Option<u64>,

        /// Boot the VM but skip provisioning
        #[arg(long)]
        no_provision: bool,
    },

    /// Stop the VM and its helper daemons
    Stop,

    /// Stop the VM and remove its backend state
    Destroy,

    /// Re-apply the deployment to the running VM
    Provision,

    /// Fetch every catalog asset into the cache without starting anything
    Download,

    /// Show or change anonymous usage data collection
    Telemetry {
        #[arg(long, conflicts_with = "off")]
        on: bool,

        #[arg(long)]
        off: bool,
    },

    /// Deliver spooled analytics events (started by `cfdev start`)
    #[command(hide = true)]
    Analyticsd,
}

fn parse_memory(s: &str) -> Result<u64, String> {
    crate::util::parse_memory_mb(s).map_err(|e| e.to_string())
}
