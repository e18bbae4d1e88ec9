//! Host architecture and cross-architecture emulation checks
//!
//! Non-native containers run through QEMU user-mode emulation registered with
//! the kernel's binfmt_misc. A missing handler is reported before any
//! container is created.

use crate::error::{PkgmillError, PkgmillResult};
use std::path::{Path, PathBuf};

/// Where the kernel exposes registered binfmt handlers
pub const BINFMT_DIR: &str = "/proc/sys/fs/binfmt_misc";

/// Host architecture in distribution naming (`x86_64`, `aarch64`, ...)
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "x86",
        "arm" => "armv7",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Normalize the many aliases distributions use for one architecture
pub fn normalize(architecture: &str) -> &str {
    match architecture {
        "amd64" | "x86-64" => "x86_64",
        "arm64" | "arm64-v8a" => "aarch64",
        "armhf" | "armv6h" | "armv6l" => "armv6",
        "armv7h" | "armv7l" => "armv7",
        "i386" | "i486" | "i586" | "i686" => "x86",
        "ppc64el" | "ppc64le" => "ppc64le",
        other => other,
    }
}

/// Whether running `architecture` on this host needs emulation
pub fn is_foreign(architecture: &str) -> bool {
    let host = host_architecture();
    let wanted = normalize(architecture);
    if wanted == host {
        return false;
    }
    // 64-bit x86 hosts run 32-bit x86 natively
    !(host == "x86_64" && wanted == "x86")
}

/// Architectures that can run under emulation with a `--platform` value
pub const EMULATED_ARCHITECTURES: &[&str] =
    &["x86_64", "aarch64", "armv7", "armv6", "ppc64le", "s390x", "x86", "riscv64"];

/// `--platform` value for an architecture
pub fn docker_platform(architecture: &str) -> Option<&'static str> {
    Some(match normalize(architecture) {
        "x86_64" => "linux/amd64",
        "aarch64" => "linux/arm64/v8",
        "armv7" => "linux/arm/v7",
        "armv6" => "linux/arm/v6",
        "ppc64le" => "linux/ppc64le",
        "s390x" => "linux/s390x",
        "x86" => "linux/386",
        "riscv64" => "linux/riscv64",
        _ => return None,
    })
}

/// binfmt_misc entry name of the QEMU handler for an architecture
pub fn qemu_handler(architecture: &str) -> Option<&'static str> {
    Some(match normalize(architecture) {
        "x86_64" => "qemu-x86_64",
        "aarch64" => "qemu-aarch64",
        "armv7" | "armv6" => "qemu-arm",
        "ppc64le" => "qemu-ppc64le",
        "s390x" => "qemu-s390x",
        "x86" => "qemu-i386",
        "riscv64" => "qemu-riscv64",
        _ => return None,
    })
}

/// Fail unless `architecture` appears in a distribution's supported list
pub fn check_supported(distribution: &str, architecture: &str, supported: &[&str]) -> PkgmillResult<()> {
    let wanted = normalize(architecture);
    if supported.iter().any(|a| normalize(a) == wanted) {
        return Ok(());
    }
    Err(PkgmillError::UnsupportedArchitecture {
        architecture: architecture.to_string(),
        distribution: distribution.to_string(),
        supported: supported.join(" "),
    })
}

/// Fail unless a foreign architecture has a registered QEMU handler
pub fn check_emulator(architecture: &str, binfmt_dir: &Path) -> PkgmillResult<()> {
    if !is_foreign(architecture) {
        return Ok(());
    }

    let Some(handler) = qemu_handler(architecture) else {
        return Err(PkgmillError::UnsupportedArchitecture {
            architecture: architecture.to_string(),
            distribution: "this host".to_string(),
            supported: registered_emulators(binfmt_dir).join(" "),
        });
    };

    let path = binfmt_dir.join(handler);
    if is_enabled(&path) {
        Ok(())
    } else {
        Err(PkgmillError::EmulatorMissing {
            architecture: architecture.to_string(),
            handler: path.display().to_string(),
        })
    }
}

/// A binfmt_misc entry counts only when its first line reads `enabled`
fn is_enabled(handler: &Path) -> bool {
    std::fs::read_to_string(handler)
        .is_ok_and(|content| content.lines().next().map(str::trim) == Some("enabled"))
}

/// QEMU handlers currently registered and enabled, for status reporting
pub fn registered_emulators(binfmt_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(binfmt_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| is_enabled(&e.path()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("qemu-"))
        .collect();
    names.sort();
    names
}

/// Default binfmt directory as a path
pub fn default_binfmt_dir() -> PathBuf {
    PathBuf::from(BINFMT_DIR)
}
