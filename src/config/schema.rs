//! Configuration schema for pkgmill
//!
//! Configuration is stored at `~/.config/pkgmill/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Environment variable overriding `[general] verbosity`
pub const VERBOSITY_ENV: &str = "PKGMILL_VERBOSITY";

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache locations and lifetimes
    pub cache: CacheConfig,

    /// Container runtime settings
    pub runtime: RuntimeConfig,

    /// Per-mirror overrides, keyed by mirror name
    pub mirrors: BTreeMap<String, MirrorOverride>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 0 = silent, 1 = echo container commands, 2 = also stream their output
    pub verbosity: u8,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbosity: 1,
            log_format: "text".to_string(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of all persistent caches (default: the user cache dir)
    pub root: Option<PathBuf>,

    /// Days a lazily computed container result stays valid
    pub lazy_ttl_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            lazy_ttl_days: 7,
        }
    }
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Force `docker` or `podman` instead of probing `PATH`
    pub program: Option<String>,

    /// Where registered QEMU binfmt handlers are listed
    pub binfmt_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: None,
            binfmt_dir: PathBuf::from(crate::orchestration::platform::BINFMT_DIR),
        }
    }
}

/// Overrides for one built-in mirror
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorOverride {
    /// Port to listen on
    pub port: Option<u16>,

    /// Upstream repository root
    pub base_url: Option<String>,
}

impl Config {
    /// Root directory for mirror caches and the lazy container table
    pub fn cache_root(&self) -> PathBuf {
        self.cache.root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pkgmill")
        })
    }

    /// Effective verbosity, honoring `PKGMILL_VERBOSITY`
    pub fn verbosity(&self) -> u8 {
        std::env::var(VERBOSITY_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u8>().ok())
            .unwrap_or(self.general.verbosity)
    }

    pub fn lazy_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache.lazy_ttl_days))
    }

    pub fn mirror_override(&self, name: &str) -> Option<&MirrorOverride> {
        self.mirrors.get(name)
    }
}
