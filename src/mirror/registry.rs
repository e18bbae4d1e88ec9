//! Built-in mirrors for the supported distributions

use crate::config::{Config, MirrorOverride};
use crate::error::{PkgmillError, PkgmillResult};
use crate::mirror::{CachedMirror, Freshness, MirrorConfig};
use std::path::Path;

/// Compile-time description of a built-in mirror. `{port}` in `install` is
/// replaced with the effective port.
struct Builtin {
    name: &'static str,
    base_url: &'static str,
    index: &'static [&'static str],
    ignore: &'static [&'static str],
    port: u16,
    install: &'static str,
    freshness: &'static [Freshness],
    package_version: &'static str,
}

const PACMAN_INDEX: &[&str] = &["*.db", "*.files"];
const PACMAN_SIGNATURES: &[&str] = &["*.db.sig", "*.files.sig"];
const PACMAN_VERSION: &str = r"(.+-)([^-]+-\d+)(-[^-]+)";

const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "arch",
        base_url: "https://geo.mirror.pkgbuild.com/",
        index: PACMAN_INDEX,
        ignore: PACMAN_SIGNATURES,
        port: 8900,
        install: "echo 'Server = http://0.0.0.0:{port}/$repo/os/$arch' > /etc/pacman.d/mirrorlist && sed -i s/NoProgressBar/Color/ /etc/pacman.conf",
        freshness: &[Freshness::LastModified],
        package_version: PACMAN_VERSION,
    },
    Builtin {
        name: "alpine",
        base_url: "https://dl-cdn.alpinelinux.org/alpine/",
        index: &["APKINDEX.tar.gz"],
        ignore: &[],
        port: 8901,
        install: r"sed -r -i 's#^.*/(v[0-9]+\.[0-9]+|edge)/#http://0.0.0.0:{port}/\1/#g' /etc/apk/repositories",
        freshness: &[Freshness::Hourly, Freshness::LastModified],
        package_version: r"(.+-)([^-]+-r\d+)(\.apk)",
    },
    Builtin {
        name: "void",
        base_url: "https://repo-default.voidlinux.org/",
        index: &["*-repodata"],
        ignore: &[],
        port: 8902,
        install: concat!(
            r"sed 's|https://repo-default.voidlinux.org|http://0.0.0.0:{port}|g' /usr/share/xbps.d/00-repository-main.conf > /etc/xbps.d/00-repository-main.conf",
            r" && sed -E 's|https://repo-default.voidlinux.org/(.*)|http://0.0.0.0:{port}/\1/bootstrap|g' /usr/share/xbps.d/00-repository-main.conf > /etc/xbps.d/10-repository-bootstrap.conf",
        ),
        freshness: &[Freshness::LastModified],
        package_version: r"(.+-)([^_-]+_\d+)(\..+)",
    },
    Builtin {
        name: "manjaro",
        base_url: "https://repo.manjaro.org/repo/",
        index: PACMAN_INDEX,
        ignore: PACMAN_SIGNATURES,
        port: 8903,
        install: concat!(
            "if grep -q /arm-stable/ /etc/pacman.d/mirrorlist ; ",
            "then echo 'Server = http://0.0.0.0:{port}/arm-stable/$repo/$arch' > /etc/pacman.d/mirrorlist; ",
            "else echo 'Server = http://0.0.0.0:{port}/stable/$repo/$arch' > /etc/pacman.d/mirrorlist; fi; ",
            "sed -i 's/#Color/Color/' /etc/pacman.conf",
        ),
        freshness: &[Freshness::LastModified],
        package_version: PACMAN_VERSION,
    },
    Builtin {
        name: "opensuse",
        base_url: "http://download.opensuse.org",
        index: &["repomd.xml", "repomd.xml.key", "repomd.xml.asc"],
        ignore: &[],
        port: 8904,
        install: "sed -r -i 's|http://download.opensuse.org/|http://0.0.0.0:{port}/|g' /etc/zypp/repos.d/*",
        // Upstream timestamps are unreliable
        freshness: &[Freshness::Always],
        package_version: r"(.+-)([^-]+-[^-]+)(\.\w+\.rpm)",
    },
];

/// Names of all built-in mirrors
pub fn names() -> Vec<&'static str> {
    BUILTINS.iter().map(|b| b.name).collect()
}

/// Build the configuration of a built-in mirror caching under
/// `cache_root/<name>`
pub fn builtin(
    name: &str,
    cache_root: &Path,
    overrides: Option<&MirrorOverride>,
) -> PkgmillResult<MirrorConfig> {
    let builtin = BUILTINS
        .iter()
        .find(|b| b.name == name)
        .ok_or_else(|| PkgmillError::UnknownMirror(name.to_string()))?;

    let port = overrides.and_then(|o| o.port).unwrap_or(builtin.port);
    let base_url = overrides
        .and_then(|o| o.base_url.as_deref())
        .unwrap_or(builtin.base_url);

    MirrorConfig::new(builtin.name, base_url, cache_root.join(builtin.name), port)
        .index_patterns(builtin.index)?
        .ignore_patterns(builtin.ignore)?
        .freshness(builtin.freshness)
        .package_version_pattern(builtin.package_version)
        .map(|config| config.install(builtin.install.replace("{port}", &port.to_string())))
}

/// A built-in mirror with the user's overrides applied
pub fn mirror(name: &str, config: &Config) -> PkgmillResult<CachedMirror> {
    builtin(name, &config.cache_root(), config.mirror_override(name)).map(CachedMirror::new)
}

/// Every built-in mirror, in port order
pub fn all(config: &Config) -> PkgmillResult<Vec<CachedMirror>> {
    BUILTINS.iter().map(|b| mirror(b.name, config)).collect()
}
