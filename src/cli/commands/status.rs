//! Status command - check the container runtime and emulators

use crate::config::Config;
use crate::error::PkgmillResult;
use crate::orchestration::{detect, platform};
use console::{style, Emoji};

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[FAIL] ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "[WARN] ");

fn flag(enabled: bool) -> console::StyledObject<&'static str> {
    if enabled {
        style("yes").green()
    } else {
        style("no").dim()
    }
}

/// Execute the status command
pub async fn execute(config: &Config) -> PkgmillResult<()> {
    println!("{}", style("pkgmill System Status").bold().cyan());
    println!();

    let runtime_ok = check_runtime(config).await;
    check_emulators(config);
    show_cache(config);

    println!();
    if runtime_ok {
        println!("{}", style("All critical checks passed").green().bold());
    } else {
        println!(
            "{}",
            style("Some checks failed - see above for details").yellow().bold()
        );
    }

    Ok(())
}

async fn check_runtime(config: &Config) -> bool {
    println!("{}", style("Container runtime:").bold());

    let detector = detect::init_global(config.runtime.program.as_deref());
    match detector.info().await {
        Ok(info) => {
            println!(
                "  {} {} {} ({})",
                CHECK,
                style(info.variant).green(),
                info.version,
                info.program
            );
            println!("      pids-limit: {}", flag(info.capabilities.pids_limit));
            println!("      buildkit:   {}", flag(info.capabilities.buildkit));
            true
        }
        Err(e) => {
            println!("  {} {}", CROSS, style(&e).red());
            if let Some(hint) = e.hint() {
                println!("      {}", hint);
            }
            false
        }
    }
}

fn check_emulators(config: &Config) {
    println!();
    println!("{}", style("Emulation:").bold());
    println!("  {} Host architecture: {}", CHECK, platform::host_architecture());

    let emulators = platform::registered_emulators(&config.runtime.binfmt_dir);
    if emulators.is_empty() {
        println!(
            "  {} {} - foreign architecture builds need qemu-user-static",
            WARN,
            style("No QEMU handlers registered").yellow()
        );
    } else {
        println!("  {} Registered: {}", CHECK, emulators.join(", "));
    }
}

fn show_cache(config: &Config) {
    println!();
    println!("{}", style("Caches:").bold());
    println!("  {} Root: {}", CHECK, config.cache_root().display());
    println!("  {} Lazy container TTL: {} days", CHECK, config.cache.lazy_ttl_days);
}
