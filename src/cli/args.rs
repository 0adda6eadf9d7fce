use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// anvil - run builds through a warm background daemon
#[derive(Parser)]
#[command(name = "anvil")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// JSON output for status commands
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a build command through the daemon, streaming its output
    #[command(after_help = "EXAMPLES:\n    anvil build -- cargo build --release\n    anvil build --dir ../service -- make test")]
    Build {
        /// Working directory for the build (defaults to the current directory)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// The build command line, program first
        #[arg(required = true, last = true)]
        args: Vec<String>,
    },

    /// Manage the background build daemons
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Show registered daemons and recent stop events
    Status,

    /// Evict registry entries whose process is gone
    Purge,
}
