use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "corral", about = "Reconcile machine-tool VMs into host connections")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "corral.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List machines reported by the machine tool
    List,

    /// Create a new machine
    Init {
        /// Machine name; the configured default applies when omitted
        name: Option<String>,

        /// Number of CPUs
        #[arg(long)]
        cpus: Option<u64>,

        /// Memory size (e.g. "4G")
        #[arg(long)]
        memory: Option<String>,

        /// Disk size (e.g. "20G")
        #[arg(long)]
        disk_size: Option<String>,
    },

    /// Start a machine
    Start {
        /// Machine name
        name: String,
    },

    /// Stop a machine
    Stop {
        /// Machine name
        name: String,
    },

    /// Remove a machine
    Rm {
        /// Machine name
        name: String,
    },

    /// Run the reconciliation loop until Ctrl-C
    Watch,
}
