//! Caching package repository mirrors
//!
//! Each [`CachedMirror`] is an HTTP reverse proxy in front of one
//! distribution's package repository. Files are cached on disk under a path
//! mirroring the upstream URL. Package files are immutable once cached;
//! repository index files are re-checked against upstream with the mirror's
//! [`Freshness`] strategies.
//!
//! Concurrent first requests for the same path may each download it. Every
//! download goes to its own temporary file which is renamed into place once
//! complete, so readers never see a partial file and the last writer wins
//! with identical bytes. There is no cross-process lock on the cache.

mod fetch;
pub mod freshness;
mod handler;
pub mod prune;
pub mod range;
pub mod registry;
mod server;
mod upstream;

pub use freshness::Freshness;
pub use server::{CachedMirror, MirrorGuard};

use crate::error::{PkgmillError, PkgmillResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use upstream::Upstream;

/// Time limits on upstream requests and on stopping a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    /// Waiting for upstream response headers
    pub response: Duration,
    /// Receiving one whole upstream body
    pub body: Duration,
    /// How long stopping a server waits for in-flight downloads. Downloads
    /// still running afterwards finish in the background.
    pub shutdown: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            response: Duration::from_secs(60),
            body: Duration::from_secs(60 * 60),
            shutdown: Duration::from_secs(30),
        }
    }
}

/// Static description of one mirror
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub name: String,
    /// Upstream repository root, without trailing slash
    pub base_url: String,
    /// Persistent cache directory
    pub base_dir: PathBuf,
    /// File name globs of index files that can go stale
    pub index_patterns: Vec<glob::Pattern>,
    /// Request path globs always answered with 404
    pub ignore_patterns: Vec<glob::Pattern>,
    /// Port to listen on; 0 picks a free one
    pub port: u16,
    /// Shell command pointing a container's package manager at this mirror
    pub install: String,
    pub freshness: Vec<Freshness>,
    /// Anchored `(prefix)(version)(suffix)` file name regex used for pruning
    pub package_version_pattern: Option<Regex>,
    pub timeouts: Timeouts,
}

fn compile_globs(mirror: &str, patterns: &[&str]) -> PkgmillResult<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| PkgmillError::InvalidPattern {
                mirror: mirror.to_string(),
                pattern: p.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Rewrite an install command for hosts where containers cannot use the
/// host's network namespace and must reach it by name instead.
pub fn host_reachable_install(install: &str) -> String {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        install.replace("0.0.0.0", "host.docker.internal")
    } else {
        install.to_string()
    }
}

impl MirrorConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl AsRef<str>,
        base_dir: impl Into<PathBuf>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            base_dir: base_dir.into(),
            index_patterns: Vec::new(),
            ignore_patterns: Vec::new(),
            port,
            install: String::new(),
            freshness: vec![Freshness::LastModified],
            package_version_pattern: None,
            timeouts: Timeouts::default(),
        }
    }

    pub fn index_patterns(mut self, patterns: &[&str]) -> PkgmillResult<Self> {
        self.index_patterns = compile_globs(&self.name, patterns)?;
        Ok(self)
    }

    pub fn ignore_patterns(mut self, patterns: &[&str]) -> PkgmillResult<Self> {
        self.ignore_patterns = compile_globs(&self.name, patterns)?;
        Ok(self)
    }

    pub fn install(mut self, install: impl AsRef<str>) -> Self {
        self.install = host_reachable_install(install.as_ref());
        self
    }

    pub fn freshness(mut self, strategies: &[Freshness]) -> Self {
        self.freshness = strategies.to_vec();
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn package_version_pattern(mut self, pattern: &str) -> PkgmillResult<Self> {
        let anchored = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            PkgmillError::InvalidPattern {
                mirror: self.name.clone(),
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.package_version_pattern = Some(anchored);
        Ok(self)
    }

    /// Whether a request path must be answered with 404
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore_patterns.iter().any(|p| p.matches(path))
    }

    /// Whether a cached file is a repository index file
    pub fn is_index(&self, cache: &Path) -> bool {
        let Some(name) = cache.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.index_patterns.iter().any(|p| p.matches(name))
    }

    /// Cache location of a request path
    pub fn cache_path(&self, path: &str) -> PathBuf {
        self.base_dir.join(path.trim_start_matches('/'))
    }
}

/// Shared state of a running mirror's request handlers
pub(crate) struct MirrorContext {
    pub(crate) config: MirrorConfig,
    pub(crate) upstream: Upstream,
    verbose: AtomicBool,
}

impl MirrorContext {
    pub(crate) fn new(config: MirrorConfig) -> Self {
        let upstream = Upstream::new(&config.base_url, &config.timeouts);
        Self {
            config,
            upstream,
            verbose: AtomicBool::new(false),
        }
    }

    pub(crate) fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub(crate) fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MirrorConfig {
        MirrorConfig::new("arch", "https://geo.mirror.pkgbuild.com/", "/var/cache/arch", 8900)
            .index_patterns(&["*.db", "*.files"])
            .unwrap()
            .ignore_patterns(&["*.db.sig", "*.files.sig"])
            .unwrap()
    }

    #[test]
    fn trailing_slash_is_stripped() {
        assert_eq!(config().base_url, "https://geo.mirror.pkgbuild.com");
    }

    #[test]
    fn ignore_patterns_match_whole_path() {
        let config = config();
        assert!(config.is_ignored("/core/os/x86_64/core.db.sig"));
        assert!(!config.is_ignored("/core/os/x86_64/core.db"));
    }

    #[test]
    fn index_patterns_match_file_name() {
        let config = config();
        assert!(config.is_index(Path::new("/var/cache/arch/core/os/x86_64/core.db")));
        assert!(!config.is_index(Path::new("/var/cache/arch/core/os/x86_64/gcc-13-1-x86_64.pkg.tar.zst")));
    }

    #[test]
    fn cache_path_mirrors_url_path() {
        assert_eq!(
            config().cache_path("/core/os/x86_64/core.db"),
            PathBuf::from("/var/cache/arch/core/os/x86_64/core.db")
        );
    }

    #[test]
    fn invalid_patterns_are_reported() {
        let err = MirrorConfig::new("x", "http://x", "/tmp", 0)
            .package_version_pattern("(unclosed")
            .unwrap_err();
        assert!(matches!(err, PkgmillError::InvalidPattern { .. }));
    }
}
