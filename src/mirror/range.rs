//! `Range: bytes=start-end` handling

use regex::Regex;
use std::sync::OnceLock;

/// Inclusive byte window of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` value for a resource of `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// What to send for a request against a resource of known length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable Range header: send everything with 200
    Full,
    /// Send this window with 206
    Partial(ByteRange),
    /// Starts beyond the end: 416
    Unsatisfiable,
}

fn range_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*bytes=(\d*)-(\d*)").expect("static regex"))
}

/// Resolve a `Range` header against a resource of `len` bytes.
///
/// Only the first range of a multi-range request is honored. Absent or
/// malformed headers mean the whole resource.
pub fn resolve(header: Option<&str>, len: u64) -> RangeRequest {
    let Some(captures) = header.and_then(|h| range_regex().captures(h)) else {
        return RangeRequest::Full;
    };
    let parse = |i: usize| -> Result<Option<u64>, ()> {
        match captures.get(i).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
            Some(digits) => digits.parse::<u64>().map(Some).map_err(|_| ()),
            None => Ok(None),
        }
    };
    let (Ok(start), Ok(end)) = (parse(1), parse(2)) else {
        return RangeRequest::Full;
    };

    match (start, end) {
        (None, None) => RangeRequest::Full,
        // Suffix: the last `n` bytes
        (None, Some(n)) => {
            if n == 0 || len == 0 {
                RangeRequest::Unsatisfiable
            } else {
                RangeRequest::Partial(ByteRange {
                    start: len - n.min(len),
                    end: len - 1,
                })
            }
        }
        (Some(start), end) => {
            if start >= len {
                return RangeRequest::Unsatisfiable;
            }
            let end = end.unwrap_or(len - 1).min(len - 1);
            if end < start {
                return RangeRequest::Full;
            }
            RangeRequest::Partial(ByteRange { start, end })
        }
    }
}
