//! Cache pruning
//!
//! Keeps only the newest cached version of each package. File names are split
//! by a per-distribution `(prefix)(version)(suffix)` regex; files sharing a
//! prefix and suffix in one directory are versions of the same package.

use crate::error::{PkgmillError, PkgmillResult};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Age after which an abandoned `.part` download is deleted
const STALE_PART_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Number(u128),
    Text(String),
}

/// Sort key of a version string: alternating numeric and textual runs
fn version_key(version: &str) -> Vec<Segment> {
    let mut key = Vec::new();
    let mut chars = version.chars().peekable();
    while let Some(&first) = chars.peek() {
        let numeric = first.is_ascii_digit();
        let mut run = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() != numeric {
                break;
            }
            run.push(c);
            chars.next();
        }
        key.push(match run.parse::<u128>() {
            Ok(n) if numeric => Segment::Number(n),
            _ => Segment::Text(run),
        });
    }
    key
}

/// Compare two version strings the way package file names order them
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_key(a).cmp(&version_key(b))
}

/// Delete all but the newest version of each package under `root`,
/// recursively. Returns the number of files removed.
pub fn prune(root: &Path, pattern: &Regex) -> PkgmillResult<usize> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(PkgmillError::io(format!("listing {}", root.display()), e)),
    };

    let mut removed = 0;
    let mut packages: HashMap<(String, String), Vec<String>> = HashMap::new();

    for entry in entries {
        let entry = entry.map_err(|e| PkgmillError::io(format!("listing {}", root.display()), e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| PkgmillError::io(format!("inspecting {}", path.display()), e))?;

        if file_type.is_dir() {
            removed += prune(&path, pattern)?;
            continue;
        }

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };

        if name.starts_with('.') && name.ends_with(".part") {
            let abandoned = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .is_some_and(|age| age > STALE_PART_AGE);
            if abandoned && std::fs::remove_file(&path).is_ok() {
                debug!("Removed abandoned download {}", path.display());
                removed += 1;
            }
            continue;
        }

        if let Some(captures) = pattern.captures(&name) {
            let part = |i| captures.get(i).map_or("", |m| m.as_str()).to_string();
            packages
                .entry((part(1), part(3)))
                .or_default()
                .push(part(2));
        }
    }

    for ((prefix, suffix), mut versions) in packages {
        if versions.len() < 2 {
            continue;
        }
        versions.sort_by(|a, b| compare_versions(a, b));
        versions.pop();
        for version in versions {
            let path = root.join(format!("{}{}{}", prefix, version, suffix));
            debug!("Pruning superseded {}", path.display());
            std::fs::remove_file(&path)
                .map_err(|e| PkgmillError::io(format!("removing {}", path.display()), e))?;
            removed += 1;
        }
    }

    Ok(removed)
}
