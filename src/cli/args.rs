//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Top-level command line
#[derive(Parser, Debug)]
#[command(name = "pkgmill")]
#[command(author, version, about = "pkgmill - Distribution packaging toolkit", long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "PKGMILL_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage caching package mirrors
    Mirror(MirrorArgs),

    /// Check the container runtime and emulators
    Status,
}

/// Arguments for the mirror command
#[derive(Parser, Debug)]
pub struct MirrorArgs {
    #[command(subcommand)]
    pub action: MirrorAction,
}

/// Mirror subcommands
#[derive(Subcommand, Debug)]
pub enum MirrorAction {
    /// List built-in mirrors with their ports and cache directories
    List,

    /// Serve a mirror in the foreground until Ctrl+C
    Serve {
        /// Mirror name (see `pkgmill mirror list`)
        name: String,
    },

    /// Run a command while a mirror is serving
    Run {
        /// Mirror name
        name: String,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the shell command that points a container at a mirror
    InstallCommand {
        /// Mirror name
        name: String,
    },
}
