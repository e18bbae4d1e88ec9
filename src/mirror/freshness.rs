//! Freshness strategies for repository index files
//!
//! An index file is re-downloaded when any strategy reports an upstream sync
//! newer than the cached copy's modification time.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How to learn when upstream last changed an index file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Freshness {
    /// Upstream's `Last-Modified` header for the file
    LastModified,
    /// The repository only syncs on the hour
    Hourly,
    /// Every cached index file is stale
    Always,
}

/// Parse an HTTP date (`Wed, 21 Oct 2015 07:28:00 GMT`)
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    let parsed = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let seconds = u64::try_from(parsed.timestamp()).ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(seconds))
}

/// `now` rounded down to the start of its hour
pub fn start_of_hour(now: SystemTime) -> SystemTime {
    let seconds = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    UNIX_EPOCH + Duration::from_secs(seconds / 3600 * 3600)
}

impl Freshness {
    fn is_stale(
        &self,
        cached: SystemTime,
        now: SystemTime,
        last_modified: &mut dyn FnMut() -> Option<SystemTime>,
    ) -> bool {
        match self {
            Self::Always => true,
            Self::Hourly => start_of_hour(now) > cached,
            // An unreachable upstream keeps the cached copy usable
            Self::LastModified => last_modified().is_some_and(|t| t > cached),
        }
    }
}

/// Whether a cached index file modified at `cached` must be re-downloaded.
///
/// `last_modified` is only invoked when a [`Freshness::LastModified`]
/// strategy is reached.
pub fn is_stale(
    strategies: &[Freshness],
    cached: SystemTime,
    now: SystemTime,
    mut last_modified: impl FnMut() -> Option<SystemTime>,
) -> bool {
    strategies
        .iter()
        .any(|s| s.is_stale(cached, now, &mut last_modified))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn parses_http_dates() {
        assert_eq!(
            parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(at(1_445_412_480))
        );
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn last_modified_compares_with_mtime() {
        let cached = at(1_000);
        assert!(is_stale(&[Freshness::LastModified], cached, at(5_000), || Some(at(2_000))));
        assert!(!is_stale(&[Freshness::LastModified], cached, at(5_000), || Some(at(500))));
        assert!(!is_stale(&[Freshness::LastModified], cached, at(5_000), || None));
    }

    #[test]
    fn hourly_uses_top_of_hour() {
        let now = at(10 * 3600 + 1_200);
        assert!(is_stale(&[Freshness::Hourly], at(9 * 3600 + 3_000), now, || None));
        assert!(!is_stale(&[Freshness::Hourly], at(10 * 3600 + 5), now, || None));
    }

    #[test]
    fn always_is_stale() {
        assert!(is_stale(&[Freshness::Always], SystemTime::now(), SystemTime::now(), || None));
    }

    #[test]
    fn header_only_queried_when_needed() {
        let mut queried = 0;
        let stale = is_stale(
            &[Freshness::Hourly, Freshness::LastModified],
            at(0),
            at(7_200),
            || {
                queried += 1;
                None
            },
        );
        assert!(stale);
        assert_eq!(queried, 0);
    }
}
