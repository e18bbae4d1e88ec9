//! pkgmill - Distribution packaging toolkit
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use pkgmill::cli::{Cli, Commands, MirrorAction, MirrorArgs};
use pkgmill::config::{Config, ConfigManager};
use pkgmill::error::PkgmillResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli, config: &Config) {
    // A foreground mirror logs every request at info
    let serving = matches!(
        cli.command,
        Commands::Mirror(MirrorArgs {
            action: MirrorAction::Serve { .. }
        })
    );

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 if !serving => EnvFilter::new("pkgmill=warn"),
        0 | 1 => EnvFilter::new("pkgmill=info"),
        _ => EnvFilter::new("pkgmill=debug"),
    };

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    }
}

async fn run() -> PkgmillResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    init_logging(&cli, &config);
    debug!("Configuration from {}", config_manager.path().display());

    match cli.command {
        Commands::Mirror(args) => pkgmill::cli::commands::mirror(args, &config).await,
        Commands::Status => pkgmill::cli::commands::status(&config).await,
    }
}
