//! Mirror command - list, serve and use the caching mirrors

use crate::cli::{MirrorAction, MirrorArgs};
use crate::config::Config;
use crate::error::{PkgmillError, PkgmillResult};
use crate::mirror::registry;
use crate::process::{Invocation, ProcessRunner, SystemRunner};
use console::style;
use tracing::debug;

/// Execute the mirror command
pub async fn execute(args: MirrorArgs, config: &Config) -> PkgmillResult<()> {
    match args.action {
        MirrorAction::List => list(config),
        MirrorAction::Serve { name } => registry::mirror(&name, config)?.serve().await,
        MirrorAction::Run { name, command } => run(&name, command, config).await,
        MirrorAction::InstallCommand { name } => {
            println!("{}", registry::mirror(&name, config)?.install());
            Ok(())
        }
    }
}

fn list(config: &Config) -> PkgmillResult<()> {
    let mirrors = registry::all(config)?;

    println!(
        "{:<10} {:<6} {:<45} {}",
        style("NAME").bold(),
        style("PORT").bold(),
        style("UPSTREAM").bold(),
        style("CACHE").bold()
    );
    for mirror in &mirrors {
        let cache = mirror.config().base_dir.display().to_string();
        println!(
            "{:<10} {:<6} {:<45} {}",
            style(mirror.name()).cyan(),
            mirror.port(),
            mirror.base_url(),
            style(cache).dim()
        );
    }
    Ok(())
}

async fn run(name: &str, command: Vec<String>, config: &Config) -> PkgmillResult<()> {
    let mirror = registry::mirror(name, config)?;
    let mut argv = command.into_iter();
    let program = argv
        .next()
        .ok_or_else(|| PkgmillError::Internal("empty command".to_string()))?;
    let invocation = Invocation::new(program).args(argv);

    let guard = mirror.enter()?;
    debug!("Mirror {} up on port {}, running {}", name, guard.port(), invocation.display());
    let result = SystemRunner.interactive(&invocation).await;
    guard.release().await;

    match result? {
        0 => Ok(()),
        code => Err(PkgmillError::command_exec(
            invocation.display(),
            format!("exited with status {}", code),
        )),
    }
}
